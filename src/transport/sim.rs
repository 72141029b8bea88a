//! In-memory transport for tests and the `simulate` command.
//!
//! All mesh bases of one process register with a shared `SimNetwork`. Links can
//! be partitioned (frames are dropped silently), severed (sends fail) or
//! duplicating (every frame arrives twice), and an
//! optional jitter delays each frame by a pseudo-random amount derived from
//! the link and a frame counter, so runs are reproducible.

use crate::identifier::NetworkIdentifier;
use crate::transport::{Channel, ReceiveHandler, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

type Link = (NetworkIdentifier, NetworkIdentifier);

#[derive(Default)]
struct SimState {
    handlers: RwLock<HashMap<NetworkIdentifier, Arc<dyn ReceiveHandler>>>,
    partitioned: RwLock<HashSet<Link>>,
    severed: RwLock<HashSet<Link>>,
    duplicating: RwLock<HashSet<Link>>,
    jitter: RwLock<Duration>,
    frames: AtomicU64,
    dropped: AtomicU64,
}

/// Shared broker that routes frames between simulated mesh bases.
#[derive(Clone, Default)]
pub struct SimNetwork {
    state: Arc<SimState>,
}

fn link(a: &NetworkIdentifier, b: &NetworkIdentifier) -> Link {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every frame by up to `max` (zero disables jitter).
    pub fn with_jitter(max: Duration) -> Self {
        let network = Self::new();
        network.set_jitter(max);
        network
    }

    pub fn set_jitter(&self, max: Duration) {
        *self.state.jitter.write() = max;
    }

    /// Drop every frame between `a` and `b` without telling the sender.
    pub fn partition(&self, a: &NetworkIdentifier, b: &NetworkIdentifier) {
        self.state.partitioned.write().insert(link(a, b));
    }

    /// Make sends between `a` and `b` fail.
    pub fn sever(&self, a: &NetworkIdentifier, b: &NetworkIdentifier) {
        self.state.severed.write().insert(link(a, b));
    }

    /// Deliver every frame between `a` and `b` twice.
    pub fn duplicate(&self, a: &NetworkIdentifier, b: &NetworkIdentifier) {
        self.state.duplicating.write().insert(link(a, b));
    }

    /// Restore the link between `a` and `b`.
    pub fn heal(&self, a: &NetworkIdentifier, b: &NetworkIdentifier) {
        let link = link(a, b);
        self.state.partitioned.write().remove(&link);
        self.state.severed.write().remove(&link);
        self.state.duplicating.write().remove(&link);
    }

    pub fn heal_all(&self) {
        self.state.partitioned.write().clear();
        self.state.severed.write().clear();
        self.state.duplicating.write().clear();
    }

    pub fn is_bound(&self, local: &NetworkIdentifier) -> bool {
        self.state.handlers.read().contains_key(local)
    }

    /// Frames handed to the network so far.
    pub fn frames_sent(&self) -> u64 {
        self.state.frames.load(Ordering::Relaxed)
    }

    /// Frames lost to partitions so far.
    pub fn frames_dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl SimState {
    fn delay_for(&self, from: &NetworkIdentifier, to: &NetworkIdentifier, frame: u64) -> Duration {
        let max = *self.jitter.read();
        if max.is_zero() {
            return Duration::ZERO;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(from.as_str().as_bytes());
        hasher.update(to.as_str().as_bytes());
        hasher.update(&frame.to_le_bytes());
        let digest = hasher.finalize();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest.as_bytes()[..8]);
        let micros = max.as_micros().max(1) as u64;
        Duration::from_micros(u64::from_le_bytes(seed) % micros)
    }

    fn deliver(
        &self,
        from: &NetworkIdentifier,
        to: &NetworkIdentifier,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        let link = link(from, to);
        if self.severed.read().contains(&link) {
            return Err(TransportError::Send {
                peer: to.clone(),
                reason: "link severed".to_string(),
            });
        }
        let handler = self
            .handlers
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Send {
                peer: to.clone(),
                reason: "no mesh base bound".to_string(),
            })?;

        let frame = self.frames.fetch_add(1, Ordering::Relaxed);
        if self.partitioned.read().contains(&link) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(from = %from, to = %to, frame, "Dropping frame on partitioned link");
            return Ok(());
        }

        let delay = self.delay_for(from, to, frame);
        let duplicate = self.duplicating.read().contains(&link);
        let from = from.clone();
        let hand_over = move || {
            if duplicate {
                handler.on_receive(from.clone(), bytes.clone());
            }
            handler.on_receive(from, bytes);
        };
        if delay.is_zero() {
            hand_over();
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                hand_over();
            });
        }
        Ok(())
    }
}

struct SimChannel {
    local: NetworkIdentifier,
    peer: NetworkIdentifier,
    state: Arc<SimState>,
}

#[async_trait]
impl Channel for SimChannel {
    fn peer(&self) -> &NetworkIdentifier {
        &self.peer
    }

    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.state.deliver(&self.local, &self.peer, bytes)
    }
}

#[async_trait]
impl Transport for SimNetwork {
    async fn open_channel(
        &self,
        local: &NetworkIdentifier,
        peer: &NetworkIdentifier,
    ) -> Result<Arc<dyn Channel>, TransportError> {
        if !self.is_bound(peer) {
            return Err(TransportError::Connect {
                peer: peer.clone(),
                reason: "peer not found in network".to_string(),
            });
        }
        Ok(Arc::new(SimChannel {
            local: local.clone(),
            peer: peer.clone(),
            state: self.state.clone(),
        }))
    }

    fn bind(
        &self,
        local: &NetworkIdentifier,
        handler: Arc<dyn ReceiveHandler>,
    ) -> Result<(), TransportError> {
        let mut handlers = self.state.handlers.write();
        if handlers.contains_key(local) {
            return Err(TransportError::AlreadyBound(local.clone()));
        }
        handlers.insert(local.clone(), handler);
        Ok(())
    }

    fn unbind(&self, local: &NetworkIdentifier) {
        self.state.handlers.write().remove(local);
    }
}
