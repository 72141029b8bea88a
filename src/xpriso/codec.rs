//! Byte encoding of Xpriso messages.

use crate::error::MeshError;
use crate::xpriso::message::XprisoMessage;

/// Encode a message for the transport.
pub fn encode(message: &XprisoMessage) -> Result<Vec<u8>, MeshError> {
    bincode::serialize(message)
        .map_err(|e| MeshError::Protocol(format!("Failed to encode message: {}", e)))
}

/// Decode a message received from the transport.
pub fn decode(bytes: &[u8]) -> Result<XprisoMessage, MeshError> {
    bincode::deserialize(bytes)
        .map_err(|e| MeshError::Protocol(format!("Failed to decode message: {}", e)))
}
