//! In-memory map of locally known mesh objects.

use crate::error::MeshError;
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::mesh::change::{Change, SnapshotSet};
use crate::mesh::object::{MeshObject, MeshObjectSnapshot, ReplicaInfo, Tombstone};
use crate::mesh::transaction::TransactionToken;
use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;
use tracing::debug;

/// Authoritative local state of every object this mesh base knows about.
///
/// Tombstoned objects stay in the map until their deletion has been confirmed
/// by every replica, but are invisible to lookups.
#[derive(Debug)]
pub struct MeshObjectStore {
    local: NetworkIdentifier,
    objects: HashMap<MeshObjectIdentifier, MeshObject>,
}

impl MeshObjectStore {
    pub fn new(local: NetworkIdentifier) -> Self {
        Self {
            local,
            objects: HashMap::new(),
        }
    }

    pub fn local(&self) -> &NetworkIdentifier {
        &self.local
    }

    pub fn find_object(&self, identifier: &MeshObjectIdentifier) -> Result<&MeshObject, MeshError> {
        self.get(identifier)
            .ok_or_else(|| MeshError::NotFound(identifier.clone()))
    }

    pub fn get(&self, identifier: &MeshObjectIdentifier) -> Option<&MeshObject> {
        self.objects.get(identifier).filter(|o| !o.is_tombstoned())
    }

    pub(crate) fn get_mut(&mut self, identifier: &MeshObjectIdentifier) -> Option<&mut MeshObject> {
        self.objects
            .get_mut(identifier)
            .filter(|o| !o.is_tombstoned())
    }

    /// Whether the identifier is taken, including by a tombstone.
    pub fn contains(&self, identifier: &MeshObjectIdentifier) -> bool {
        self.objects.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.objects.values().filter(|o| !o.is_tombstoned()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a new home replica.
    pub fn create_object(
        &mut self,
        _token: &TransactionToken,
        identifier: MeshObjectIdentifier,
        types: BTreeSet<String>,
    ) -> Result<&MeshObject, MeshError> {
        if self.contains(&identifier) {
            return Err(MeshError::IdentifierInUse(identifier));
        }
        let mut snapshot = MeshObjectSnapshot::new(identifier.clone());
        snapshot.types = types;
        let object = MeshObject::new(snapshot, ReplicaInfo::home(&self.local));
        Ok(&*self.objects.entry(identifier).or_insert(object))
    }

    /// Apply a local change. The object must hold its lock.
    pub fn mutate(&mut self, token: &TransactionToken, change: &Change) -> Result<(), MeshError> {
        match change {
            Change::Created { identifier, types } => {
                self.create_object(token, identifier.clone(), types.clone())?;
            }
            Change::Deleted { identifier } => {
                let object = self.writable(identifier)?;
                let awaiting = object.replica.all_proxies();
                self.tombstone(identifier, awaiting);
            }
            other => {
                let object = self.writable(other.identifier())?;
                other.apply_to(&mut object.state);
                object.touch();
            }
        }
        Ok(())
    }

    fn writable(&mut self, identifier: &MeshObjectIdentifier) -> Result<&mut MeshObject, MeshError> {
        let object = self
            .get_mut(identifier)
            .ok_or_else(|| MeshError::NotFound(identifier.clone()))?;
        if !object.replica.has_lock {
            return Err(MeshError::LockRequired(identifier.clone()));
        }
        Ok(object)
    }

    /// Apply a change received from `from`.
    ///
    /// Changes that are already reflected are no-ops, so replays are harmless.
    /// A deletion leaves a tombstone waiting for the replicas downstream of
    /// `from`. Returns whether anything changed.
    pub(crate) fn apply_remote(&mut self, from: &NetworkIdentifier, change: &Change) -> bool {
        match change {
            Change::Created { .. } => false,
            Change::Deleted { identifier } => match self.get(identifier) {
                Some(object) => {
                    let downstream = object.replica.proxies_except(Some(from));
                    self.tombstone(identifier, downstream);
                    true
                }
                None => false,
            },
            other => match self.get_mut(other.identifier()) {
                Some(object) => {
                    let changed = other.apply_to(&mut object.state);
                    if changed {
                        object.touch();
                    }
                    changed
                }
                None => {
                    debug!(
                        identifier = %other.identifier(),
                        "Ignoring change for object without local replica"
                    );
                    false
                }
            },
        }
    }

    /// Mark an object deleted; it is purged once `awaiting` is empty.
    pub(crate) fn tombstone(
        &mut self,
        identifier: &MeshObjectIdentifier,
        awaiting: BTreeSet<NetworkIdentifier>,
    ) {
        if awaiting.is_empty() {
            self.objects.remove(identifier);
            return;
        }
        if let Some(object) = self.objects.get_mut(identifier) {
            object.tombstone = Some(Tombstone {
                deleted_at: Instant::now(),
                awaiting,
            });
        }
    }

    /// Record that `peer` confirmed a deletion. Returns true once the object is gone.
    pub(crate) fn acknowledge_deletion(
        &mut self,
        identifier: &MeshObjectIdentifier,
        peer: &NetworkIdentifier,
    ) -> bool {
        if !self.objects.contains_key(identifier) {
            return true;
        }
        let done = match self
            .objects
            .get_mut(identifier)
            .and_then(|o| o.tombstone.as_mut())
        {
            Some(tombstone) => {
                tombstone.awaiting.remove(peer);
                tombstone.awaiting.is_empty()
            }
            None => false,
        };
        if done {
            self.objects.remove(identifier);
        }
        done
    }

    /// Whether `identifier` is deleted here and still waiting for confirmations.
    pub fn is_tombstoned(&self, identifier: &MeshObjectIdentifier) -> bool {
        self.objects
            .get(identifier)
            .map(|o| o.is_tombstoned())
            .unwrap_or(false)
    }

    /// Physically remove an object, tombstoned or not.
    pub(crate) fn purge(&mut self, identifier: &MeshObjectIdentifier) -> Option<MeshObject> {
        self.objects.remove(identifier)
    }

    /// Insert or replace a replica received from elsewhere.
    pub(crate) fn insert_replica(&mut self, object: MeshObject) {
        self.objects.insert(object.identifier().clone(), object);
    }

    /// Copies of the given objects as they are now, absent ones included.
    pub(crate) fn checkpoint<'a, I>(&self, identifiers: I) -> Vec<(MeshObjectIdentifier, Option<MeshObject>)>
    where
        I: IntoIterator<Item = &'a MeshObjectIdentifier>,
    {
        identifiers
            .into_iter()
            .map(|id| (id.clone(), self.objects.get(id).cloned()))
            .collect()
    }

    /// Put back objects recorded by `checkpoint`.
    pub(crate) fn restore(&mut self, checkpoint: Vec<(MeshObjectIdentifier, Option<MeshObject>)>) {
        for (identifier, object) in checkpoint {
            match object {
                Some(object) => {
                    self.objects.insert(identifier, object);
                }
                None => {
                    self.objects.remove(&identifier);
                }
            }
        }
    }

    /// Live objects.
    pub fn iter(&self) -> impl Iterator<Item = &MeshObject> {
        self.objects.values().filter(|o| !o.is_tombstoned())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut MeshObject> {
        self.objects.values_mut().filter(|o| !o.is_tombstoned())
    }

    /// Tombstoned objects still waiting for confirmations.
    pub fn tombstones(&self) -> impl Iterator<Item = &MeshObject> {
        self.objects.values().filter(|o| o.is_tombstoned())
    }

    pub fn snapshots(&self) -> SnapshotSet {
        self.iter()
            .map(|o| (o.identifier().clone(), o.snapshot().clone()))
            .collect()
    }

    /// Whether changes to `identifier` still go to `peer`: a live replica
    /// exchanging updates with it, or a deletion it has not confirmed.
    pub(crate) fn routes_through(&self, identifier: &MeshObjectIdentifier, peer: &NetworkIdentifier) -> bool {
        match self.objects.get(identifier) {
            Some(object) => match &object.tombstone {
                Some(tombstone) => tombstone.awaiting.contains(peer),
                None => object.replica.all_proxies().contains(peer),
            },
            None => false,
        }
    }

    /// Whether any object, tombstones included, still routes through `peer`.
    pub fn references_peer(&self, peer: &NetworkIdentifier) -> bool {
        self.objects.values().any(|o| {
            o.replica.references(peer)
                || o.tombstone
                    .as_ref()
                    .map(|t| t.awaiting.contains(peer))
                    .unwrap_or(false)
        })
    }
}
