//! In-memory mesh object store, for tests and the `memory` backend.

use crate::error::StorageError;
use crate::identifier::MeshObjectIdentifier;
use crate::storage::{MeshStore, StoredObject};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryMeshStore {
    objects: RwLock<HashMap<MeshObjectIdentifier, Vec<u8>>>,
}

impl MemoryMeshStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl MeshStore for MemoryMeshStore {
    fn load_object(
        &self,
        identifier: &MeshObjectIdentifier,
    ) -> Result<Option<StoredObject>, StorageError> {
        self.objects
            .read()
            .get(identifier)
            .map(|bytes| StoredObject::decode(bytes))
            .transpose()
    }

    fn save_object(&self, object: &StoredObject) -> Result<(), StorageError> {
        let bytes = object.encode()?;
        self.objects
            .write()
            .insert(object.identifier().clone(), bytes);
        Ok(())
    }

    fn delete_object(&self, identifier: &MeshObjectIdentifier) -> Result<(), StorageError> {
        self.objects.write().remove(identifier);
        Ok(())
    }
}
