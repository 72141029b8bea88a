//! Sled-backed mesh object store

use crate::error::StorageError;
use crate::identifier::MeshObjectIdentifier;
use crate::storage::{MeshStore, StoredObject};
use std::path::Path;

/// Sled-based implementation of MeshStore, keyed by identifier external form.
pub struct SledMeshStore {
    db: sled::Db,
}

fn io_error(context: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {}", context, e),
    ))
}

impl SledMeshStore {
    /// Open (or create) a sled database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| io_error("Failed to open sled database", e))?;
        Ok(Self { db })
    }

    /// Get the underlying sled database (for advanced operations)
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Check if an object is stored
    pub fn contains(&self, identifier: &MeshObjectIdentifier) -> Result<bool, StorageError> {
        self.db
            .contains_key(identifier.to_external_form().as_bytes())
            .map_err(|e| io_error("Failed to check object", e))
    }

    /// Every stored object.
    pub fn list_all(&self) -> Result<Vec<StoredObject>, StorageError> {
        let mut objects = Vec::new();
        for item in self.db.iter() {
            let (_, value) = item.map_err(|e| io_error("Failed to iterate store", e))?;
            objects.push(StoredObject::decode(&value)?);
        }
        Ok(objects)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| io_error("Failed to flush store", e))?;
        Ok(())
    }
}

impl MeshStore for SledMeshStore {
    fn load_object(
        &self,
        identifier: &MeshObjectIdentifier,
    ) -> Result<Option<StoredObject>, StorageError> {
        match self
            .db
            .get(identifier.to_external_form().as_bytes())
            .map_err(|e| io_error("Failed to get object", e))?
        {
            Some(value) => Ok(Some(StoredObject::decode(&value)?)),
            None => Ok(None),
        }
    }

    fn save_object(&self, object: &StoredObject) -> Result<(), StorageError> {
        let value = object.encode()?;
        self.db
            .insert(object.identifier().to_external_form().as_bytes(), value)
            .map_err(|e| io_error("Failed to put object", e))?;
        Ok(())
    }

    fn delete_object(&self, identifier: &MeshObjectIdentifier) -> Result<(), StorageError> {
        self.db
            .remove(identifier.to_external_form().as_bytes())
            .map_err(|e| io_error("Failed to delete object", e))?;
        Ok(())
    }

    fn save_batch(&self, objects: &[StoredObject]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for object in objects {
            batch.insert(
                object.identifier().to_external_form().as_bytes(),
                object.encode()?,
            );
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| io_error("Failed to apply batch", e))?;
        Ok(())
    }
}
