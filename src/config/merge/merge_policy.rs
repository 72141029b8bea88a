//! Merge rules: defaults first, then files, then environment.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("mesh.lock_timeout_ms", 5_000)?
        .set_default("mesh.request_timeout_ms", 10_000)?
        .set_default("mesh.liveness_threshold_ms", 30_000)?
        .set_default("mesh.heartbeat_interval_ms", 10_000)?
        .set_default("mesh.delete_propagation_timeout_ms", 60_000)?
        .set_default("mesh.maintenance_interval_ms", 1_000)?
        .set_default("mesh.give_up_lock", true)?
        .set_default("mesh.give_up_home_replica", false)?
        .set_default("mesh.event_buffer", 256)?
        .set_default("storage.backend", "memory")
}
