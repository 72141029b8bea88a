//! CLI route: single route table and run context.

use crate::cli::parse::{Commands, ConfigCommands, SchemaCommands};
use crate::cli::presentation::{
    format_config_json, format_config_text, format_schema_summary, format_simulation_table,
    SimulationRow,
};
use crate::config::{ConfigLoader, NetMeshConfig};
use crate::error::MeshError;
use crate::identifier::NetworkIdentifier;
use crate::meshbase::NetMeshBase;
use crate::model::{EntityType, PropertyValue, TypeRegistry};
use crate::transport::SimNetwork;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const COUNTER_TYPE: &str = "Counter";
const COUNTER_PROPERTY: &str = "count";

/// Runtime context for CLI execution: the merged configuration and where it
/// came from.
pub struct RunContext {
    config: NetMeshConfig,
    config_path: Option<PathBuf>,
}

impl RunContext {
    /// Load configuration from `config_path` if given, else from the layered
    /// sources under `root`.
    pub fn new(root: &Path, config_path: Option<PathBuf>) -> Result<Self, MeshError> {
        let config = match &config_path {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(root)?,
        };
        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn config(&self) -> &NetMeshConfig {
        &self.config
    }

    /// Execute a CLI command via the route table.
    pub fn execute(&self, command: &Commands) -> Result<String, MeshError> {
        match command {
            Commands::Config { command } => self.handle_config(command),
            Commands::Schema { command } => self.handle_schema(command),
            Commands::Simulate {
                hosts,
                rounds,
                jitter_ms,
            } => {
                let rt = tokio::runtime::Runtime::new()
                    .map_err(|e| MeshError::Config(format!("Failed to start runtime: {}", e)))?;
                rt.block_on(self.simulate(*hosts, *rounds, Duration::from_millis(*jitter_ms)))
            }
        }
    }

    fn handle_config(&self, command: &ConfigCommands) -> Result<String, MeshError> {
        match command {
            ConfigCommands::Show { format } => match format.as_str() {
                "json" => format_config_json(&self.config),
                "text" => format_config_text(&self.config),
                other => Err(MeshError::Config(format!(
                    "Unknown format {:?}, expected text or json",
                    other
                ))),
            },
            ConfigCommands::Validate => match self.config.validate() {
                Ok(()) => {
                    let source = self
                        .config_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "layered sources".to_string());
                    Ok(format!("Configuration from {} is valid", source))
                }
                Err(errors) => {
                    let messages: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
                    Err(MeshError::Config(format!(
                        "Configuration validation failed:\n{}",
                        messages.join("\n")
                    )))
                }
            },
        }
    }

    fn handle_schema(&self, command: &SchemaCommands) -> Result<String, MeshError> {
        match command {
            SchemaCommands::Check { path } => {
                let registry = TypeRegistry::load(path)?;
                Ok(format_schema_summary(&registry))
            }
        }
    }

    /// Create a counter on the first host, then let every host in turn
    /// increment it. Each write moves the lock to the writing host.
    async fn simulate(&self, hosts: usize, rounds: usize, jitter: Duration) -> Result<String, MeshError> {
        if hosts < 2 {
            return Err(MeshError::Config("simulate needs at least two hosts".to_string()));
        }
        info!(hosts, rounds, jitter_ms = jitter.as_millis() as u64, "Starting simulation");
        let network = Arc::new(SimNetwork::with_jitter(jitter));
        let mut registry = TypeRegistry::new();
        registry.register_entity_type(EntityType::new(COUNTER_TYPE).with_property(COUNTER_PROPERTY));

        let mut bases = Vec::with_capacity(hosts);
        for index in 0..hosts {
            let network_id = NetworkIdentifier::parse(&format!("sim://host-{}", index))?;
            let base = NetMeshBase::builder(network_id, network.clone())
                .registry(registry.clone())
                .config(self.config.mesh.clone())
                .build()?;
            bases.push(base);
        }

        let counter = bases[0].create_object(None, &[COUNTER_TYPE]).await?;
        bases[0].set_property(&counter, COUNTER_PROPERTY, 0_i64).await?;
        for round in 0..rounds {
            let base = &bases[(round + 1) % hosts];
            base.obtain_object(&counter).await?;
            // The lock transfer brings the holder's latest state along.
            base.obtain_lock(&counter).await?;
            let current = base
                .find_object(&counter)?
                .property(COUNTER_PROPERTY)
                .and_then(PropertyValue::as_i64)
                .unwrap_or(0);
            let report = base.set_property(&counter, COUNTER_PROPERTY, current + 1).await?;
            debug!(host = %base.local(), value = current + 1, warnings = report.warnings.len(), "Simulation write");
        }
        // Let the last changes reach every replica.
        tokio::time::sleep(jitter * 2 + Duration::from_millis(50)).await;

        let rows: Vec<SimulationRow> = bases
            .iter()
            .map(|base| {
                let object = base.find_object(&counter).ok();
                SimulationRow {
                    host: base.local().to_string(),
                    objects: base.snapshots().len(),
                    is_home: object.as_ref().map(|o| o.is_home_replica()).unwrap_or(false),
                    has_lock: object.as_ref().map(|o| o.has_lock()).unwrap_or(false),
                    value: object
                        .as_ref()
                        .and_then(|o| o.property(COUNTER_PROPERTY))
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    proxies: base.proxies().len(),
                }
            })
            .collect();
        for base in &bases {
            base.cease_communications();
        }
        Ok(format_simulation_table(
            &rows,
            network.frames_sent(),
            network.frames_dropped(),
        ))
    }
}
