//! State shared by the mesh base handle, the lock coordinator and the
//! inbound task.

use crate::config::MeshConfig;
use crate::error::{MeshError, StorageError};
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::mesh::{ChangeSet, MeshObjectStore};
use crate::proxy::{ProxyManager, ProxyPolicy};
use crate::security::{AccessManager, Operation};
use crate::storage::{MeshStore, StoredObject};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{trace, warn};

pub(crate) struct Shared {
    /// Network identifier of this mesh base
    pub(crate) local: NetworkIdentifier,
    pub(crate) config: MeshConfig,
    /// The only state needing mutual exclusion; never held across an await
    pub(crate) store: Mutex<MeshObjectStore>,
    /// Durable mirror of `store`
    pub(crate) storage: Arc<dyn MeshStore>,
    pub(crate) security: Arc<dyn AccessManager>,
    pub(crate) proxies: ProxyManager,
    /// Committed and applied change sets, for subscribers
    pub(crate) events: broadcast::Sender<ChangeSet>,
    /// Objects staged by the open transaction; their locks are not handed out
    pub(crate) pinned: Mutex<HashSet<MeshObjectIdentifier>>,
    /// Bumped whenever tombstones are purged
    pub(crate) purged: watch::Sender<u64>,
}

impl Shared {
    pub(crate) fn policy(&self) -> &ProxyPolicy {
        self.proxies.policy()
    }

    pub(crate) fn permitted(
        &self,
        caller: &NetworkIdentifier,
        identifier: &MeshObjectIdentifier,
        operation: Operation,
    ) -> bool {
        self.security
            .check_permitted_access(caller, identifier, operation)
            .is_permitted()
    }

    pub(crate) fn is_pinned(&self, identifier: &MeshObjectIdentifier) -> bool {
        self.pinned.lock().contains(identifier)
    }

    /// Make sure `identifier` is in memory if storage has it. Returns whether
    /// a live object is now present.
    pub(crate) fn swap_in(
        &self,
        store: &mut MeshObjectStore,
        identifier: &MeshObjectIdentifier,
    ) -> Result<bool, MeshError> {
        if store.contains(identifier) {
            return Ok(store.get(identifier).is_some());
        }
        match self.storage.load_object(identifier)? {
            Some(stored) => {
                trace!(identifier = %identifier, "Swapped in object from storage");
                store.insert_replica(stored.into());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write the current state of `identifiers` through to storage. Objects
    /// that are gone or tombstoned are deleted from it.
    pub(crate) fn persist<'a, I>(&self, store: &MeshObjectStore, identifiers: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = &'a MeshObjectIdentifier>,
    {
        let mut batch = Vec::new();
        for identifier in identifiers {
            match store.get(identifier) {
                Some(object) => batch.push(StoredObject::from(object)),
                None => self.storage.delete_object(identifier)?,
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.storage.save_batch(&batch)
    }

    /// `persist` for state that is already in effect; failures are logged.
    pub(crate) fn persist_logged<'a, I>(&self, store: &MeshObjectStore, identifiers: I)
    where
        I: IntoIterator<Item = &'a MeshObjectIdentifier>,
    {
        if let Err(e) = self.persist(store, identifiers) {
            warn!(local = %self.local, error = %e, "Failed to persist replica state");
        }
    }

    /// Wake everything waiting for a deletion to settle.
    pub(crate) fn note_purged(&self) {
        self.purged.send_modify(|count| *count = count.wrapping_add(1));
    }

    pub(crate) fn emit(&self, changes: &ChangeSet) {
        if changes.is_empty() {
            return;
        }
        // No subscribers is fine.
        let _ = self.events.send(changes.clone());
    }
}
