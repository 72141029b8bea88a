//! Entry points for ingesting external data into shadow replicas.
//!
//! A shadow replica mirrors an external source instead of another mesh base.
//! It never holds the lock; its content changes only through
//! [`NetMeshBase::apply_external_snapshot`], which diffs the new external
//! state against the replica and sends the result to every replica of the
//! shadow like any committed change.

use crate::differencer;
use crate::error::MeshError;
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::meshbase::commit::batches_for;
use crate::meshbase::NetMeshBase;
use crate::mesh::{ChangeSet, MeshObject, MeshObjectSnapshot, ReplicaInfo};
use std::collections::BTreeMap;
use tracing::{debug, info};

impl NetMeshBase {
    /// Make the local replica of `identifier` a shadow of `source`.
    ///
    /// Without a local replica, an empty shadow is created. An existing one
    /// must be the home replica holding the lock; it keeps its content and
    /// its downstream copies.
    pub fn mark_as_shadow(
        &self,
        identifier: &MeshObjectIdentifier,
        source: &NetworkIdentifier,
    ) -> Result<MeshObject, MeshError> {
        let shared = &self.inner.shared;
        let mut store = shared.store.lock();
        shared.swap_in(&mut store, identifier)?;

        if store.contains(identifier) && store.get(identifier).is_none() {
            return Err(MeshError::IdentifierInUse(identifier.clone()));
        }
        if shared.is_pinned(identifier) {
            return Err(MeshError::Denied(identifier.clone()));
        }

        let object = match store.get_mut(identifier) {
            Some(object) => {
                if object.is_shadow() {
                    object.replica.shadow_source = Some(source.clone());
                } else {
                    if !object.is_home_replica() || !object.has_lock() {
                        return Err(MeshError::NotHomeReplica(identifier.clone()));
                    }
                    let copies = std::mem::take(&mut object.replica.proxies_with_copies);
                    let epoch = object.replica.lock_epoch.clone();
                    object.replica = ReplicaInfo::shadow(source);
                    object.replica.proxies_with_copies = copies;
                    object.replica.lock_epoch = epoch;
                }
                object.clone()
            }
            None => {
                let object = MeshObject::new(
                    MeshObjectSnapshot::new(identifier.clone()),
                    ReplicaInfo::shadow(source),
                );
                store.insert_replica(object.clone());
                object
            }
        };
        shared.persist(&store, [identifier])?;
        info!(identifier = %identifier, source = %source, "Marked as shadow replica");
        Ok(object)
    }

    /// Bring a shadow replica in line with the external state `snapshot`.
    ///
    /// Takes the single-writer gate, so it never interleaves with a
    /// transaction. Returns the changes applied, which have been sent to the
    /// shadow's replicas by the time this returns.
    pub async fn apply_external_snapshot(
        &self,
        identifier: &MeshObjectIdentifier,
        snapshot: MeshObjectSnapshot,
    ) -> Result<ChangeSet, MeshError> {
        if &snapshot.identifier != identifier {
            return Err(MeshError::parse(
                snapshot.identifier.to_external_form(),
                format!("snapshot does not describe {}", identifier),
            ));
        }
        let gate = self.write_gate().await;
        let shared = &self.inner.shared;

        let (changes, targets) = {
            let mut store = shared.store.lock();
            shared.swap_in(&mut store, identifier)?;
            let checkpoint = store.checkpoint([identifier]);
            let object = store
                .get_mut(identifier)
                .ok_or_else(|| MeshError::NotFound(identifier.clone()))?;
            if !object.is_shadow() {
                return Err(MeshError::Denied(identifier.clone()));
            }

            let changes = differencer::diff_object(Some(object.snapshot()), Some(&snapshot));
            if changes.is_empty() {
                return Ok(changes);
            }
            object.state = snapshot;
            object.touch();
            let mut targets = BTreeMap::new();
            targets.insert(identifier.clone(), object.replica().all_proxies());

            if let Err(e) = shared.persist(&store, [identifier]) {
                store.restore(checkpoint);
                return Err(e.into());
            }
            (changes, targets)
        };
        drop(gate);

        debug!(identifier = %identifier, changes = changes.len(), "Applied external snapshot");
        shared.emit(&changes);
        self.propagate(batches_for(&changes, &targets)).await;
        Ok(changes)
    }
}
