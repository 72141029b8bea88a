//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::MeshError;

/// Map domain errors to a string for CLI output.
pub fn map_error(e: &MeshError) -> String {
    match e {
        MeshError::Config(message) => format!("Configuration error: {}", message),
        other => other.to_string(),
    }
}
