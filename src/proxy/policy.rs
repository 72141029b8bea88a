//! Timing policy shared by all proxies of a mesh base.

use crate::config::MeshConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPolicy {
    /// How long to wait for the answer to an ordinary request.
    pub request_timeout: Duration,
    /// How long to wait for a lock grant or a lock push acknowledgement.
    pub lock_timeout: Duration,
    /// Send an empty message when nothing else went out for this long.
    pub heartbeat_interval: Duration,
    /// A partner silent for longer than this is considered gone.
    pub liveness_threshold: Duration,
    /// How long a gap in inbound sequence numbers may hold back later messages.
    pub reorder_window: Duration,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for ProxyPolicy {
    fn from(config: &MeshConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            liveness_threshold: Duration::from_millis(config.liveness_threshold_ms),
            reorder_window: Duration::from_millis(config.lock_timeout_ms),
        }
    }
}
