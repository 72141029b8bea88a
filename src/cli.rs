//! CLI domain: parse, route, output, and presentation only.
//! The route table dispatches to config loading and the mesh base.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, ConfigCommands, SchemaCommands};
pub use presentation::{
    format_config_json, format_config_text, format_schema_summary, format_simulation_table,
    SimulationRow,
};
pub use route::RunContext;
