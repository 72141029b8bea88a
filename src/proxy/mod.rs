//! Proxies
//!
//! A proxy owns everything a mesh base knows about talking to one partner:
//! the outbound queue, send order, outstanding requests and liveness.

pub mod manager;
pub mod peer;
pub mod policy;

pub use manager::ProxyManager;
pub use peer::{Proxy, ProxyState, QueuedRequest};
pub use policy::ProxyPolicy;
