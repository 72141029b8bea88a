//! Durable mirror of the in-memory mesh object store.
//!
//! The mesh base writes every committed object through a `MeshStore` and
//! swaps objects back in from it when they are not in memory.

pub mod memory;
pub mod persistence;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;
use crate::identifier::MeshObjectIdentifier;
use crate::mesh::{MeshObject, MeshObjectSnapshot, ReplicaInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use memory::MemoryMeshStore;
pub use persistence::SledMeshStore;

/// Serialized form of a mesh object, replica metadata included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub snapshot: MeshObjectSnapshot,
    pub replica: ReplicaInfo,
    pub time_created: i64,
    pub time_updated: i64,
}

impl StoredObject {
    pub fn identifier(&self) -> &MeshObjectIdentifier {
        &self.snapshot.identifier
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(self)
            .map_err(|e| StorageError::Encoding(format!("Failed to serialize object: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        bincode::deserialize(bytes)
            .map_err(|e| StorageError::Encoding(format!("Failed to deserialize object: {}", e)))
    }
}

impl From<&MeshObject> for StoredObject {
    fn from(object: &MeshObject) -> Self {
        Self {
            snapshot: object.state.clone(),
            replica: object.replica.clone(),
            time_created: object.time_created,
            time_updated: object.time_updated,
        }
    }
}

impl From<StoredObject> for MeshObject {
    fn from(stored: StoredObject) -> Self {
        MeshObject {
            state: stored.snapshot,
            replica: stored.replica,
            time_created: stored.time_created,
            time_updated: stored.time_updated,
            tombstone: None,
        }
    }
}

/// Storage collaborator.
pub trait MeshStore: Send + Sync {
    fn load_object(&self, identifier: &MeshObjectIdentifier)
        -> Result<Option<StoredObject>, StorageError>;

    fn save_object(&self, object: &StoredObject) -> Result<(), StorageError>;

    fn delete_object(&self, identifier: &MeshObjectIdentifier) -> Result<(), StorageError>;

    /// Save several objects; backends may do this atomically.
    fn save_batch(&self, objects: &[StoredObject]) -> Result<(), StorageError> {
        for object in objects {
            self.save_object(object)?;
        }
        Ok(())
    }
}

/// Open the backend selected by the `[storage]` config section.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn MeshStore>, StorageError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryMeshStore::new())),
        StorageBackend::Sled => {
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SledMeshStore::new(&config.path)?))
        }
    }
}
