//! NetMeshBase
//!
//! A mesh base owns the local mesh object store and talks to other mesh bases
//! through one proxy per partner. Local writes go through transactions; the
//! lock coordinator makes sure a write only happens where the lock is, and
//! committed changes travel along the replication tree to every replica.

pub(crate) mod commit;
mod incoming;
mod maintenance;
mod replication;
pub(crate) mod shared;

pub use commit::CommitReport;
pub use maintenance::MaintenanceReport;

use crate::config::{MeshConfig, NetMeshConfig};
use crate::coordinator::LockCoordinator;
use crate::error::MeshError;
use crate::identifier::{IdentifierFactory, MeshObjectIdentifier, NetworkIdentifier};
use crate::lock::{LockEpoch, PushOutcome};
use crate::mesh::{ChangeSet, MeshObject, MeshObjectSnapshot, MeshObjectStore, SnapshotSet, Transaction};
use crate::model::{PropertyValue, TypeRegistry};
use crate::proxy::{Proxy, ProxyManager, ProxyPolicy};
use crate::security::{AccessManager, Operation, PermitAll};
use crate::storage::{self, MemoryMeshStore, MeshStore};
use crate::transport::Transport;
use parking_lot::Mutex;
use shared::Shared;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, OwnedMutexGuard};
use tracing::{debug, info};

/// Builds a `NetMeshBase`.
pub struct NetMeshBaseBuilder {
    network: NetworkIdentifier,
    transport: Arc<dyn Transport>,
    registry: TypeRegistry,
    storage: Option<Arc<dyn MeshStore>>,
    security: Option<Arc<dyn AccessManager>>,
    config: MeshConfig,
}

impl NetMeshBaseBuilder {
    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Durable mirror of the store. Defaults to an in-memory one.
    pub fn storage(mut self, storage: Arc<dyn MeshStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Access manager. Defaults to `PermitAll`.
    pub fn security(mut self, security: Arc<dyn AccessManager>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind to the transport and start receiving. Must run inside a tokio runtime.
    pub fn build(self) -> Result<NetMeshBase, MeshError> {
        let problems = self.config.validate();
        if !problems.is_empty() {
            return Err(MeshError::Config(problems.join("; ")));
        }

        let (events, _) = broadcast::channel(self.config.event_buffer);
        let policy = ProxyPolicy::from(&self.config);
        let shared = Arc::new(Shared {
            local: self.network.clone(),
            store: Mutex::new(MeshObjectStore::new(self.network.clone())),
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(MemoryMeshStore::new())),
            security: self.security.unwrap_or_else(|| Arc::new(PermitAll)),
            proxies: ProxyManager::new(self.network.clone(), self.transport.clone(), policy),
            config: self.config,
            events,
            pinned: Mutex::new(HashSet::new()),
            purged: watch::channel(0).0,
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(MeshBaseInner {
            coordinator: LockCoordinator::new(shared.clone()),
            factory: IdentifierFactory::new(self.network.clone()),
            registry: Arc::new(self.registry),
            tx_gate: Arc::new(tokio::sync::Mutex::new(())),
            undelivered: Mutex::new(BTreeMap::new()),
            transport: self.transport.clone(),
            inbound: sender.clone(),
            shared,
        });

        self.transport
            .bind(&self.network, Arc::new(incoming::InboundQueue::new(sender)))?;
        tokio::spawn(incoming::run(Arc::downgrade(&inner), receiver));

        info!(local = %self.network, "Mesh base started");
        Ok(NetMeshBase { inner })
    }
}

pub(crate) struct MeshBaseInner {
    pub(crate) shared: Arc<Shared>,
    pub(crate) coordinator: LockCoordinator,
    pub(crate) registry: Arc<TypeRegistry>,
    factory: IdentifierFactory,
    /// Single-writer gate: at most one open transaction
    tx_gate: Arc<tokio::sync::Mutex<()>>,
    /// Change batches no proxy could take, per peer, oldest first
    pub(crate) undelivered: Mutex<BTreeMap<NetworkIdentifier, Vec<ChangeSet>>>,
    transport: Arc<dyn Transport>,
    /// Work queue of the inbound task
    pub(crate) inbound: mpsc::UnboundedSender<incoming::Inbound>,
}

impl Drop for MeshBaseInner {
    fn drop(&mut self) {
        self.transport.unbind(&self.shared.local);
        debug!(local = %self.shared.local, "Mesh base stopped");
    }
}

/// Held by the open transaction. Releases the objects it pinned on drop.
pub(crate) struct WriteGate {
    _guard: OwnedMutexGuard<()>,
    shared: Arc<Shared>,
}

impl Drop for WriteGate {
    fn drop(&mut self) {
        self.shared.pinned.lock().clear();
    }
}

/// Handle to a mesh base. Cheap to clone.
#[derive(Clone)]
pub struct NetMeshBase {
    pub(crate) inner: Arc<MeshBaseInner>,
}

impl std::fmt::Debug for NetMeshBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetMeshBase")
            .field("local", &self.inner.shared.local)
            .finish()
    }
}

impl NetMeshBase {
    pub fn builder(network: NetworkIdentifier, transport: Arc<dyn Transport>) -> NetMeshBaseBuilder {
        NetMeshBaseBuilder {
            network,
            transport,
            registry: TypeRegistry::new(),
            storage: None,
            security: None,
            config: MeshConfig::default(),
        }
    }

    /// A mesh base set up from a loaded configuration: network identifier,
    /// schema file, storage backend and replication settings.
    pub fn from_config(config: &NetMeshConfig, transport: Arc<dyn Transport>) -> Result<Self, MeshError> {
        let network = config
            .network_identifier()?
            .ok_or_else(|| MeshError::Config("network_identifier is not set".to_string()))?;
        let registry = match &config.schema {
            Some(path) => TypeRegistry::load(path)?,
            None => TypeRegistry::new(),
        };
        let storage = storage::open(&config.storage)?;
        Self::builder(network, transport)
            .registry(registry)
            .storage(storage)
            .config(config.mesh.clone())
            .build()
    }

    pub fn local(&self) -> &NetworkIdentifier {
        &self.inner.shared.local
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.shared.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    pub fn create_identifier(&self) -> MeshObjectIdentifier {
        self.inner.factory.create_identifier()
    }

    /// Open a transaction, waiting for the current one to finish.
    pub async fn begin_transaction(&self) -> Transaction {
        let gate = self.write_gate().await;
        Transaction::new(self.clone(), gate)
    }

    /// Wait until no other writer is active.
    pub(crate) async fn write_gate(&self) -> WriteGate {
        let guard = self.inner.tx_gate.clone().lock_owned().await;
        WriteGate {
            _guard: guard,
            shared: self.inner.shared.clone(),
        }
    }

    /// Create an object in a transaction of its own.
    pub async fn create_object(
        &self,
        identifier: Option<MeshObjectIdentifier>,
        types: &[&str],
    ) -> Result<MeshObjectIdentifier, MeshError> {
        let mut tx = self.begin_transaction().await;
        let identifier = tx.create_object(identifier, types).await?;
        tx.commit().await?;
        Ok(identifier)
    }

    pub async fn bless(
        &self,
        identifier: &MeshObjectIdentifier,
        type_name: &str,
    ) -> Result<CommitReport, MeshError> {
        let mut tx = self.begin_transaction().await;
        tx.bless(identifier, type_name).await?;
        tx.commit().await
    }

    pub async fn set_property(
        &self,
        identifier: &MeshObjectIdentifier,
        property: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<CommitReport, MeshError> {
        let mut tx = self.begin_transaction().await;
        tx.set_property(identifier, property, value).await?;
        tx.commit().await
    }

    pub async fn relate(
        &self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<CommitReport, MeshError> {
        let mut tx = self.begin_transaction().await;
        tx.relate(a, b).await?;
        tx.commit().await
    }

    pub async fn bless_relationship(
        &self,
        source: &MeshObjectIdentifier,
        destination: &MeshObjectIdentifier,
        relationship: &str,
    ) -> Result<CommitReport, MeshError> {
        let mut tx = self.begin_transaction().await;
        tx.bless_relationship(source, destination, relationship)
            .await?;
        tx.commit().await
    }

    pub async fn delete_object(&self, identifier: &MeshObjectIdentifier) -> Result<CommitReport, MeshError> {
        let mut tx = self.begin_transaction().await;
        tx.delete(identifier).await?;
        tx.commit().await
    }

    /// The local replica of an object, from memory or storage.
    pub fn find_object(&self, identifier: &MeshObjectIdentifier) -> Result<MeshObject, MeshError> {
        let shared = &self.inner.shared;
        let mut store = shared.store.lock();
        shared.swap_in(&mut store, identifier)?;
        store.find_object(identifier).cloned()
    }

    /// The local replica of an object, fetching one from its home if needed.
    pub async fn obtain_object(&self, identifier: &MeshObjectIdentifier) -> Result<MeshObject, MeshError> {
        self.access_locally(crate::access::AccessSpecification::direct(identifier.clone()))
            .await
    }

    /// Whether the identifier is taken here, in memory or in storage.
    pub fn contains(&self, identifier: &MeshObjectIdentifier) -> bool {
        let shared = &self.inner.shared;
        if shared.store.lock().contains(identifier) {
            return true;
        }
        matches!(shared.storage.load_object(identifier), Ok(Some(_)))
    }

    /// Snapshots of every live local object.
    pub fn snapshots(&self) -> SnapshotSet {
        self.inner.shared.store.lock().snapshots()
    }

    /// Change sets committed here or applied from other mesh bases.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.inner.shared.events.subscribe()
    }

    pub fn proxy(&self, partner: &NetworkIdentifier) -> Option<Arc<Proxy>> {
        self.inner.shared.proxies.get(partner)
    }

    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.inner.shared.proxies.all()
    }

    /// Tell every partner this mesh base is going away.
    pub fn cease_communications(&self) {
        info!(local = %self.local(), "Ceasing communications");
        self.inner.shared.proxies.cease_all();
    }

    pub(crate) fn check_local_access(
        &self,
        identifier: &MeshObjectIdentifier,
        operation: Operation,
    ) -> Result<(), MeshError> {
        if self.inner.shared.permitted(self.local(), identifier, operation) {
            Ok(())
        } else {
            Err(MeshError::NotPermitted {
                caller: self.local().clone(),
                identifier: identifier.clone(),
                operation,
            })
        }
    }

    /// Make `identifier` writable by the open transaction: fetch a replica if
    /// there is none, obtain the lock, and pin the object so the lock stays
    /// here until the transaction ends.
    pub(crate) async fn prepare_for_write(
        &self,
        identifier: &MeshObjectIdentifier,
    ) -> Result<MeshObjectSnapshot, MeshError> {
        self.check_local_access(identifier, Operation::Write)?;
        let shared = &self.inner.shared;
        let present = {
            let mut store = shared.store.lock();
            shared.swap_in(&mut store, identifier)?
        };
        if !present {
            if identifier.network() == self.local() {
                return Err(MeshError::NotFound(identifier.clone()));
            }
            self.access_locally(crate::access::AccessSpecification::direct(identifier.clone()))
                .await?;
        }

        self.inner.coordinator.ensure_lock(identifier).await?;
        let store = shared.store.lock();
        let object = store.find_object(identifier)?;
        if !object.has_lock() {
            // Handed away between obtaining and pinning.
            return Err(MeshError::LockUnavailable {
                identifier: identifier.clone(),
                cause: crate::error::LockFailure::Denied,
            });
        }
        shared.pinned.lock().insert(identifier.clone());
        Ok(object.snapshot().clone())
    }

    /// Obtain the lock of an object without writing it.
    pub async fn obtain_lock(&self, identifier: &MeshObjectIdentifier) -> Result<(), MeshError> {
        self.check_local_access(identifier, Operation::ObtainLock)?;
        self.inner.coordinator.ensure_lock(identifier).await
    }

    /// Hand the lock of an object to an adjacent replica.
    pub async fn push_lock(
        &self,
        identifier: &MeshObjectIdentifier,
        peer: &NetworkIdentifier,
    ) -> Result<PushOutcome, MeshError> {
        self.inner.coordinator.push_lock(identifier, peer).await
    }

    /// Take back the lock of an object homed here.
    pub fn reclaim_lock(&self, identifier: &MeshObjectIdentifier) -> Result<LockEpoch, MeshError> {
        self.inner.coordinator.reclaim_lock(identifier)
    }

    /// Whether the local replica hands its lock out on request.
    pub fn set_give_up_lock(&self, identifier: &MeshObjectIdentifier, give_up: bool) -> Result<(), MeshError> {
        self.update_replica(identifier, |replica| replica.give_up_lock = give_up)
    }

    /// Whether the local home replica hands over home status on request.
    pub fn set_give_up_home(&self, identifier: &MeshObjectIdentifier, give_up: bool) -> Result<(), MeshError> {
        self.update_replica(identifier, |replica| replica.give_up_home = give_up)
    }

    fn update_replica<F>(&self, identifier: &MeshObjectIdentifier, update: F) -> Result<(), MeshError>
    where
        F: FnOnce(&mut crate::mesh::ReplicaInfo),
    {
        let shared = &self.inner.shared;
        let mut store = shared.store.lock();
        shared.swap_in(&mut store, identifier)?;
        let object = store
            .get_mut(identifier)
            .ok_or_else(|| MeshError::NotFound(identifier.clone()))?;
        update(&mut object.replica);
        shared.persist(&store, [identifier])?;
        Ok(())
    }
}
