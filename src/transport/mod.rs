//! Transport collaborator
//!
//! Mesh bases exchange opaque byte frames over channels; framing and message
//! semantics live in `xpriso`. A transport delivers frames to the handler bound
//! for the receiving network identifier.

pub mod sim;

use crate::error::MeshError;
use crate::identifier::NetworkIdentifier;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use sim::SimNetwork;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {peer} failed: {reason}")]
    Connect {
        peer: NetworkIdentifier,
        reason: String,
    },

    #[error("Send to {peer} failed: {reason}")]
    Send {
        peer: NetworkIdentifier,
        reason: String,
    },

    #[error("Cannot bind {0}: already bound")]
    AlreadyBound(NetworkIdentifier),
}

impl From<TransportError> for MeshError {
    fn from(err: TransportError) -> Self {
        MeshError::Transport(err.to_string())
    }
}

/// Receives frames addressed to a bound network identifier.
pub trait ReceiveHandler: Send + Sync {
    fn on_receive(&self, from: NetworkIdentifier, bytes: Vec<u8>);
}

/// One direction of communication towards a peer. Frames sent on the same
/// channel may be delivered out of order; the proxy restores their order.
#[async_trait]
pub trait Channel: Send + Sync {
    fn peer(&self) -> &NetworkIdentifier;

    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_channel(
        &self,
        local: &NetworkIdentifier,
        peer: &NetworkIdentifier,
    ) -> Result<Arc<dyn Channel>, TransportError>;

    fn bind(
        &self,
        local: &NetworkIdentifier,
        handler: Arc<dyn ReceiveHandler>,
    ) -> Result<(), TransportError>;

    fn unbind(&self, local: &NetworkIdentifier);
}
