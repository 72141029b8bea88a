//! Trace logging of Xpriso traffic as JSON documents.

use crate::xpriso::message::XprisoMessage;
use tracing::{enabled, trace, Level};

/// Direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Outgoing => "out",
            Direction::Incoming => "in",
        }
    }
}

/// Log a message at trace level under the `netmesh::xpriso` target.
pub fn log_message(direction: Direction, message: &XprisoMessage) {
    if !enabled!(target: "netmesh::xpriso", Level::TRACE) {
        return;
    }
    let body = serde_json::to_string(message)
        .unwrap_or_else(|e| format!("{{\"error\":\"unserializable message: {}\"}}", e));
    trace!(
        target: "netmesh::xpriso",
        direction = direction.as_str(),
        sender = %message.sender,
        receiver = %message.receiver,
        request_id = message.request_id,
        response_id = ?message.response_id,
        sequence = message.sequence,
        message = %body,
        "Xpriso message"
    );
}
