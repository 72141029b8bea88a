//! CLI parse: clap types for NetMesh. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// NetMesh CLI - replicated mesh object graph
#[derive(Parser)]
#[command(name = "netmesh")]
#[command(about = "Replicated mesh object graph with lock migration between peers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project root; config files are read from `<root>/config`
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Type registry schema commands
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Run a replication scenario on an in-memory network
    Simulate {
        /// Number of mesh bases
        #[arg(long, default_value = "3")]
        hosts: usize,
        /// Number of writes, each from the next mesh base in turn
        #[arg(long, default_value = "6")]
        rounds: usize,
        /// Maximum random delivery delay in milliseconds
        #[arg(long, default_value = "0")]
        jitter_ms: u64,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the merged configuration
    Show {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Validate the merged configuration
    Validate,
}

#[derive(Subcommand)]
pub enum SchemaCommands {
    /// Load a schema file and list the types it declares
    Check {
        /// Path to the TOML schema
        path: PathBuf,
    },
}
