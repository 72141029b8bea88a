//! CLI presentation: text and json formatters per command family.

use crate::config::NetMeshConfig;
use crate::error::MeshError;
use crate::model::TypeRegistry;
use comfy_table::Table;

/// One mesh base at the end of a simulation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRow {
    pub host: String,
    pub objects: usize,
    pub is_home: bool,
    pub has_lock: bool,
    pub value: String,
    pub proxies: usize,
}

/// Render the merged configuration as TOML.
pub fn format_config_text(config: &NetMeshConfig) -> Result<String, MeshError> {
    toml::to_string_pretty(config).map_err(|e| MeshError::Config(e.to_string()))
}

pub fn format_config_json(config: &NetMeshConfig) -> Result<String, MeshError> {
    serde_json::to_string_pretty(config).map_err(|e| MeshError::Config(e.to_string()))
}

pub fn format_simulation_table(rows: &[SimulationRow], frames_sent: u64, frames_dropped: u64) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Host", "Objects", "Home", "Lock", "Counter", "Proxies"]);
    for row in rows {
        table.add_row(vec![
            row.host.clone(),
            row.objects.to_string(),
            yes_no(row.is_home).to_string(),
            yes_no(row.has_lock).to_string(),
            row.value.clone(),
            row.proxies.to_string(),
        ]);
    }
    format!(
        "{}\nFrames sent: {}, dropped: {}",
        table, frames_sent, frames_dropped
    )
}

pub fn format_schema_summary(registry: &TypeRegistry) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Kind", "Name", "Properties / Roles"]);
    for entity_type in registry.entity_types() {
        let properties: Vec<&str> = entity_type.properties.iter().map(|p| p.name.as_str()).collect();
        table.add_row(vec![
            "entity".to_string(),
            entity_type.name.clone(),
            properties.join(", "),
        ]);
    }
    for relationship_type in registry.relationship_types() {
        table.add_row(vec![
            "relationship".to_string(),
            relationship_type.name.clone(),
            format!(
                "{}, {}",
                relationship_type.source_role(),
                relationship_type.destination_role()
            ),
        ]);
    }
    table.to_string()
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "-"
    }
}
