//! Mesh objects and their replica metadata.

use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::lock::LockEpoch;
use crate::model::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;

/// Replicated state of one mesh object: everything the differencer compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshObjectSnapshot {
    pub identifier: MeshObjectIdentifier,
    pub types: BTreeSet<String>,
    pub properties: BTreeMap<String, PropertyValue>,
    /// Neighbor identifier to the roles this object plays towards it.
    pub neighbors: BTreeMap<MeshObjectIdentifier, BTreeSet<String>>,
}

impl MeshObjectSnapshot {
    pub fn new(identifier: MeshObjectIdentifier) -> Self {
        Self {
            identifier,
            types: BTreeSet::new(),
            properties: BTreeMap::new(),
            neighbors: BTreeMap::new(),
        }
    }

    pub fn is_blessed_by(&self, type_name: &str) -> bool {
        self.types.contains(type_name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn is_related_to(&self, neighbor: &MeshObjectIdentifier) -> bool {
        self.neighbors.contains_key(neighbor)
    }

    pub fn roles_towards(&self, neighbor: &MeshObjectIdentifier) -> Option<&BTreeSet<String>> {
        self.neighbors.get(neighbor)
    }
}

/// Where a replica sits in the replication tree and what it may do.
///
/// Proxies are referenced by the network identifier of their partner; the
/// proxy objects themselves are owned by the proxy manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub is_home_replica: bool,
    pub has_lock: bool,
    pub lock_epoch: LockEpoch,
    /// Upstream replica, one step closer to the home. `None` on the home.
    pub proxy_towards_home: Option<NetworkIdentifier>,
    /// Where this replica passed the lock to, while it is out.
    pub proxy_towards_lock: Option<NetworkIdentifier>,
    /// Downstream replicas that obtained their copy from here.
    pub proxies_with_copies: BTreeSet<NetworkIdentifier>,
    pub give_up_lock: bool,
    pub give_up_home: bool,
    /// Set on shadow replicas: the ingestion source acting as home.
    pub shadow_source: Option<NetworkIdentifier>,
}

impl ReplicaInfo {
    /// Metadata of a freshly created home replica, holding the lock.
    pub fn home(local: &NetworkIdentifier) -> Self {
        Self {
            is_home_replica: true,
            has_lock: true,
            lock_epoch: LockEpoch::initial(local),
            proxy_towards_home: None,
            proxy_towards_lock: None,
            proxies_with_copies: BTreeSet::new(),
            give_up_lock: true,
            give_up_home: false,
            shadow_source: None,
        }
    }

    /// Metadata of a replica obtained through `upstream`.
    pub fn replica(upstream: &NetworkIdentifier, epoch: LockEpoch) -> Self {
        Self {
            is_home_replica: false,
            has_lock: false,
            lock_epoch: epoch,
            proxy_towards_home: Some(upstream.clone()),
            proxy_towards_lock: None,
            proxies_with_copies: BTreeSet::new(),
            give_up_lock: true,
            give_up_home: false,
            shadow_source: None,
        }
    }

    /// Metadata of a shadow replica fed by `source`.
    pub fn shadow(source: &NetworkIdentifier) -> Self {
        Self {
            is_home_replica: false,
            has_lock: false,
            lock_epoch: LockEpoch::initial(source),
            proxy_towards_home: None,
            proxy_towards_lock: None,
            proxies_with_copies: BTreeSet::new(),
            give_up_lock: false,
            give_up_home: false,
            shadow_source: Some(source.clone()),
        }
    }

    pub fn is_shadow(&self) -> bool {
        self.shadow_source.is_some()
    }

    /// Next hop when looking for the lock.
    pub fn route_towards_lock(&self) -> Option<&NetworkIdentifier> {
        self.proxy_towards_lock
            .as_ref()
            .or(self.proxy_towards_home.as_ref())
    }

    /// Every proxy this replica exchanges updates with.
    pub fn all_proxies(&self) -> BTreeSet<NetworkIdentifier> {
        let mut proxies = self.proxies_with_copies.clone();
        if let Some(home) = &self.proxy_towards_home {
            proxies.insert(home.clone());
        }
        proxies
    }

    /// Every proxy except `from`, for forwarding an update that came from `from`.
    pub fn proxies_except(&self, from: Option<&NetworkIdentifier>) -> BTreeSet<NetworkIdentifier> {
        let mut proxies = self.all_proxies();
        if let Some(from) = from {
            proxies.remove(from);
        }
        proxies
    }

    pub fn references(&self, peer: &NetworkIdentifier) -> bool {
        self.proxy_towards_home.as_ref() == Some(peer)
            || self.proxy_towards_lock.as_ref() == Some(peer)
            || self.proxies_with_copies.contains(peer)
    }

    /// Whether a change arriving from `peer` comes from the lock's direction.
    pub fn accepts_changes_from(&self, peer: &NetworkIdentifier) -> bool {
        !self.has_lock && self.route_towards_lock() == Some(peer)
    }
}

/// A deleted object waiting for its replicas to confirm the deletion.
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub deleted_at: Instant,
    pub awaiting: BTreeSet<NetworkIdentifier>,
}

/// A locally known mesh object.
#[derive(Debug, Clone)]
pub struct MeshObject {
    pub(crate) state: MeshObjectSnapshot,
    pub(crate) replica: ReplicaInfo,
    pub(crate) time_created: i64,
    pub(crate) time_updated: i64,
    pub(crate) tombstone: Option<Tombstone>,
}

impl MeshObject {
    pub(crate) fn new(state: MeshObjectSnapshot, replica: ReplicaInfo) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            state,
            replica,
            time_created: now,
            time_updated: now,
            tombstone: None,
        }
    }

    pub fn identifier(&self) -> &MeshObjectIdentifier {
        &self.state.identifier
    }

    pub fn snapshot(&self) -> &MeshObjectSnapshot {
        &self.state
    }

    pub fn replica(&self) -> &ReplicaInfo {
        &self.replica
    }

    pub fn types(&self) -> &BTreeSet<String> {
        &self.state.types
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.state.property(name)
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &MeshObjectIdentifier> {
        self.state.neighbors.keys()
    }

    pub fn is_home_replica(&self) -> bool {
        self.replica.is_home_replica
    }

    pub fn has_lock(&self) -> bool {
        self.replica.has_lock
    }

    pub fn lock_epoch(&self) -> &LockEpoch {
        &self.replica.lock_epoch
    }

    pub fn is_shadow(&self) -> bool {
        self.replica.is_shadow()
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstone.is_some()
    }

    /// Creation time, milliseconds since the Unix epoch.
    pub fn time_created(&self) -> i64 {
        self.time_created
    }

    /// Last local or applied remote modification, milliseconds since the Unix epoch.
    pub fn time_updated(&self) -> i64 {
        self.time_updated
    }

    pub(crate) fn touch(&mut self) {
        self.time_updated = chrono::Utc::now().timestamp_millis();
    }
}
