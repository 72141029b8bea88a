//! Configuration System
//!
//! Hierarchical configuration: built-in defaults, the user file, project files
//! and `NETMESH_*` environment variables, in increasing precedence.

use crate::error::MeshError;
use crate::identifier::NetworkIdentifier;
use crate::logging::LoggingConfig;
use config::Environment;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod merge;
mod sources;

pub use sources::user_file::user_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetMeshConfig {
    /// Network identifier of the local mesh base, e.g. `sim://alpha`
    #[serde(default)]
    pub network_identifier: Option<String>,

    /// Type registry schema file
    #[serde(default)]
    pub schema: Option<PathBuf>,

    #[serde(default)]
    pub mesh: MeshConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Replication timing and policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// A proxy silent for longer than this is considered gone
    #[serde(default = "default_liveness_threshold_ms")]
    pub liveness_threshold_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Tombstones older than this are removed without every acknowledgement
    #[serde(default = "default_delete_propagation_timeout_ms")]
    pub delete_propagation_timeout_ms: u64,

    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Whether replicas hand out their lock on request
    #[serde(default = "default_true")]
    pub give_up_lock: bool,

    /// Whether home replicas hand over home status on request
    #[serde(default)]
    pub give_up_home_replica: bool,

    /// Capacity of the change event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_liveness_threshold_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_delete_propagation_timeout_ms() -> u64 {
    60_000
}

fn default_maintenance_interval_ms() -> u64 {
    1_000
}

fn default_event_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            liveness_threshold_ms: default_liveness_threshold_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            delete_propagation_timeout_ms: default_delete_propagation_timeout_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            give_up_lock: true,
            give_up_home_replica: false,
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
}

/// Where mesh objects are persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "netmesh")
        .map(|dirs| dirs.data_dir().join("store"))
        .unwrap_or_else(|| PathBuf::from(".netmesh/store"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_store_path(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Mesh(String),
    Storage(String),
    Identity(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Mesh(msg) => write!(f, "Mesh: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Identity(msg) => write!(f, "Identity: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl MeshConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, value) in [
            ("lock_timeout_ms", self.lock_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("liveness_threshold_ms", self.liveness_threshold_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("delete_propagation_timeout_ms", self.delete_propagation_timeout_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
        ] {
            if value == 0 {
                problems.push(format!("{} must be greater than zero", name));
            }
        }
        if self.liveness_threshold_ms <= self.heartbeat_interval_ms {
            problems.push(format!(
                "liveness_threshold_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.liveness_threshold_ms, self.heartbeat_interval_ms
            ));
        }
        if self.event_buffer == 0 {
            problems.push("event_buffer must be greater than zero".to_string());
        }
        problems
    }
}

impl NetMeshConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors: Vec<ValidationError> = self
            .mesh
            .validate()
            .into_iter()
            .map(ValidationError::Mesh)
            .collect();

        if self.storage.backend == StorageBackend::Sled && self.storage.path.as_os_str().is_empty()
        {
            errors.push(ValidationError::Storage(
                "Store path cannot be empty".to_string(),
            ));
        }

        if let Some(raw) = &self.network_identifier {
            if let Err(e) = NetworkIdentifier::parse(raw) {
                errors.push(ValidationError::Identity(e.to_string()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The configured network identifier, parsed.
    pub fn network_identifier(&self) -> Result<Option<NetworkIdentifier>, MeshError> {
        self.network_identifier
            .as_deref()
            .map(NetworkIdentifier::parse)
            .transpose()
    }
}

/// Loads `NetMeshConfig` from its layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, user file, `project_root/config/*.toml`, then environment.
    pub fn load(project_root: &Path) -> Result<NetMeshConfig, MeshError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::user_file::add_to_builder(builder)?;
        let builder = sources::project_file::add_to_builder(builder, project_root)?;
        let config = builder
            .add_source(Environment::with_prefix("NETMESH").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Defaults plus exactly one file.
    pub fn load_from_file(path: &Path) -> Result<NetMeshConfig, MeshError> {
        if !path.exists() {
            return Err(MeshError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let config = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

/// Configuration manager for runtime updates
pub struct ConfigManager {
    config: Arc<RwLock<NetMeshConfig>>,
}

impl ConfigManager {
    pub fn new(config: NetMeshConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Reload configuration from files; the current one stays on failure.
    pub fn reload(&self, project_root: &Path) -> Result<(), MeshError> {
        let new_config = ConfigLoader::load(project_root)?;
        new_config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            MeshError::Config(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        *self.config.write() = new_config;
        Ok(())
    }

    /// Current configuration
    pub fn get(&self) -> NetMeshConfig {
        self.config.read().clone()
    }
}
