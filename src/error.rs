//! Error types for the replicated mesh object graph.

use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::security::Operation;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found in store: {0}")]
    ObjectNotFound(MeshObjectIdentifier),

    #[error("Failed to encode stored object: {0}")]
    Encoding(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Why a lock could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailure {
    /// The current holder refused the request.
    Denied,
    /// The caller gave up before the holder answered.
    Timeout,
    /// The proxy towards the holder did not answer in time.
    ProxyUnreachable,
    /// The proxy towards the holder is dead.
    ProxyDead,
    /// Another lock transfer for the same object is outstanding on that proxy.
    InFlight,
    /// No proxy leads towards the lock (shadow replica, or lock lost in transit).
    NoRoute,
}

impl std::fmt::Display for LockFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            LockFailure::Denied => "denied by holder",
            LockFailure::Timeout => "timed out",
            LockFailure::ProxyUnreachable => "proxy unreachable",
            LockFailure::ProxyDead => "proxy dead",
            LockFailure::InFlight => "transfer already in flight",
            LockFailure::NoRoute => "no route towards the lock",
        };
        f.write_str(text)
    }
}

/// Errors surfaced by mesh base operations
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Cannot parse {input:?}: {reason}")]
    Parse { input: String, reason: String },

    #[error("Mesh object not found: {0}")]
    NotFound(MeshObjectIdentifier),

    #[error("Identifier already in use: {0}")]
    IdentifierInUse(MeshObjectIdentifier),

    #[error("{caller} is not permitted to {operation} {identifier}")]
    NotPermitted {
        caller: NetworkIdentifier,
        identifier: MeshObjectIdentifier,
        operation: Operation,
    },

    #[error("Lock required to modify {0}")]
    LockRequired(MeshObjectIdentifier),

    #[error("Lock unavailable for {identifier}: {cause}")]
    LockUnavailable {
        identifier: MeshObjectIdentifier,
        cause: LockFailure,
    },

    #[error("Request for {0} denied")]
    Denied(MeshObjectIdentifier),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Proxy towards {0} is dead")]
    ProxyDead(NetworkIdentifier),

    #[error("Proxy towards {0} is unreachable")]
    ProxyUnreachable(NetworkIdentifier),

    #[error("Not the home replica of {0}")]
    NotHomeReplica(MeshObjectIdentifier),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Property {property} is not declared by any type of {identifier}")]
    IllegalProperty {
        identifier: MeshObjectIdentifier,
        property: String,
    },

    #[error("{identifier} is already blessed with {type_name}")]
    AlreadyBlessed {
        identifier: MeshObjectIdentifier,
        type_name: String,
    },

    #[error("{identifier} is not blessed with {type_name}")]
    NotBlessed {
        identifier: MeshObjectIdentifier,
        type_name: String,
    },

    #[error("{0} is already related to {1}")]
    AlreadyRelated(MeshObjectIdentifier, MeshObjectIdentifier),

    #[error("{0} is not related to {1}")]
    NotRelated(MeshObjectIdentifier, MeshObjectIdentifier),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MeshError {
    pub(crate) fn parse(input: impl Into<String>, reason: impl Into<String>) -> Self {
        MeshError::Parse {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the failed operation as is.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MeshError::LockUnavailable { .. }
                | MeshError::Denied(_)
                | MeshError::Timeout(_)
                | MeshError::ProxyDead(_)
                | MeshError::ProxyUnreachable(_)
        )
    }

    /// The lock failure cause, if this is a lock failure.
    pub fn lock_failure(&self) -> Option<LockFailure> {
        match self {
            MeshError::LockUnavailable { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for MeshError {
    fn from(err: config::ConfigError) -> Self {
        MeshError::Config(err.to_string())
    }
}

/// A non-fatal inconsistency: some replica may not have seen a committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyWarning {
    pub identifier: Option<MeshObjectIdentifier>,
    pub peer: Option<NetworkIdentifier>,
    pub message: String,
}

impl ConsistencyWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            identifier: None,
            peer: None,
            message: message.into(),
        }
    }

    pub fn for_object(mut self, identifier: &MeshObjectIdentifier) -> Self {
        self.identifier = Some(identifier.clone());
        self
    }

    pub fn for_peer(mut self, peer: &NetworkIdentifier) -> Self {
        self.peer = Some(peer.clone());
        self
    }

    /// Log this warning.
    pub(crate) fn emit(&self) {
        tracing::warn!(
            identifier = ?self.identifier.as_ref().map(|id| id.to_external_form()),
            peer = ?self.peer.as_ref().map(|p| p.as_str()),
            "Consistency warning: {}",
            self.message
        );
    }
}

impl std::fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(id) = &self.identifier {
            write!(f, " (object {})", id)?;
        }
        if let Some(peer) = &self.peer {
            write!(f, " (peer {})", peer)?;
        }
        Ok(())
    }
}
