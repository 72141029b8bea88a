//! Obtaining, refreshing and giving up replicas.

use super::NetMeshBase;
use crate::access::AccessSpecification;
use crate::differencer;
use crate::error::MeshError;
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::mesh::{ChangeSet, MeshObject, SnapshotSet};
use crate::security::Operation;
use crate::xpriso::ConveyedObject;
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

impl NetMeshBase {
    /// The local replica of the object named by `spec`.
    ///
    /// Without a local replica, one is requested along the specification's
    /// path, or from the object's own mesh base if there is none. The object
    /// at the end of the path conveys a replica back hop by hop; every hop
    /// keeps one. With `request_lock`, the lock is obtained as well.
    pub async fn access_locally(&self, spec: AccessSpecification) -> Result<MeshObject, MeshError> {
        let spec = spec.relative_to(self.local());
        let identifier = spec.object().clone();
        let shared = &self.inner.shared;
        let present = {
            let mut store = shared.store.lock();
            shared.swap_in(&mut store, &identifier)?
        };

        if !present {
            let hop = match spec.first_hop() {
                Some(hop) if hop != self.local() => hop.clone(),
                _ => return Err(MeshError::NotFound(identifier)),
            };
            debug!(identifier = %identifier, hop = %hop, "Requesting replica");
            let proxy = shared.proxies.obtain(&hop)?;
            let mut message = proxy.new_message();
            message.requested_first_time_objects.push(spec.remainder());
            let reply = proxy.request(message, shared.policy().request_timeout).await?;

            if reply.refused_objects.contains(&identifier) {
                return Err(MeshError::NotPermitted {
                    caller: self.local().clone(),
                    identifier,
                    operation: Operation::Read,
                });
            }
            // Conveyed objects were installed before the request completed.
            if shared.store.lock().get(&identifier).is_none() {
                return Err(MeshError::NotFound(identifier));
            }
            info!(identifier = %identifier, hop = %hop, "Obtained replica");
        }

        if spec.request_lock() {
            self.inner.coordinator.ensure_lock(&identifier).await?;
        }
        self.find_object(&identifier)
    }

    /// Record `peer` as holding a copy of `identifier` and describe the
    /// object for it. `None` if there is no live local replica.
    pub(crate) fn convey_to(
        &self,
        peer: &NetworkIdentifier,
        identifier: &MeshObjectIdentifier,
    ) -> Option<ConveyedObject> {
        let shared = &self.inner.shared;
        let mut store = shared.store.lock();
        if let Err(e) = shared.swap_in(&mut store, identifier) {
            warn!(identifier = %identifier, error = %e, "Cannot load replica");
        }
        let object = store.get_mut(identifier)?;
        if object.replica.proxy_towards_home.as_ref() != Some(peer) {
            object.replica.proxies_with_copies.insert(peer.clone());
        }
        let conveyed = ConveyedObject {
            snapshot: object.snapshot().clone(),
            epoch: object.lock_epoch().clone(),
        };
        shared.persist_logged(&store, [identifier]);
        debug!(identifier = %identifier, peer = %peer, "Conveyed replica");
        Some(conveyed)
    }

    /// Ask upstream for the current state of the given replicas and bring
    /// them up to date. Returns the changes applied.
    ///
    /// Replicas that hold the lock or are the home replica are already
    /// authoritative and left alone.
    pub async fn resynchronize(&self, identifiers: &[MeshObjectIdentifier]) -> Result<ChangeSet, MeshError> {
        let shared = &self.inner.shared;
        let mut before = SnapshotSet::new();
        let mut upstream: BTreeMap<NetworkIdentifier, Vec<MeshObjectIdentifier>> = BTreeMap::new();
        {
            let mut store = shared.store.lock();
            for identifier in identifiers {
                shared.swap_in(&mut store, identifier)?;
                let object = store.find_object(identifier)?;
                if object.has_lock() || object.is_home_replica() {
                    continue;
                }
                let Some(home) = object.replica().proxy_towards_home.clone() else {
                    continue;
                };
                before.insert(identifier.clone(), object.snapshot().clone());
                upstream.entry(home).or_default().push(identifier.clone());
            }
        }
        if upstream.is_empty() {
            return Ok(ChangeSet::new());
        }

        let timeout = shared.policy().request_timeout;
        let mut requests = Vec::new();
        for (peer, requested) in upstream {
            let proxy = shared.proxies.obtain(&peer)?;
            let mut message = proxy.new_message();
            message.requested_resynchronize_replicas = requested;
            requests.push(async move { proxy.request(message, timeout).await });
        }
        for outcome in join_all(requests).await {
            outcome?;
        }

        let after: SnapshotSet = {
            let store = shared.store.lock();
            before
                .keys()
                .filter_map(|id| store.get(id).map(|o| (id.clone(), o.snapshot().clone())))
                .collect()
        };
        let changes = differencer::diff(&before, &after);
        debug!(objects = before.len(), changes = changes.len(), "Resynchronized replicas");
        Ok(changes)
    }

    /// Drop the local replica of an object homed elsewhere and tell the
    /// upstream replica to stop sending updates.
    ///
    /// Only a leaf replica can be canceled: one without the lock and without
    /// downstream copies.
    pub async fn cancel_replica(&self, identifier: &MeshObjectIdentifier) -> Result<(), MeshError> {
        let shared = &self.inner.shared;
        let upstream = {
            let mut store = shared.store.lock();
            shared.swap_in(&mut store, identifier)?;
            let object = store.find_object(identifier)?;
            let replica = object.replica();
            if replica.is_home_replica || replica.has_lock || !replica.proxies_with_copies.is_empty() {
                return Err(MeshError::NotPermitted {
                    caller: self.local().clone(),
                    identifier: identifier.clone(),
                    operation: Operation::Delete,
                });
            }
            replica.proxy_towards_home.clone()
        };

        if let Some(peer) = upstream {
            let canceled = match shared.proxies.obtain(&peer) {
                Ok(proxy) => {
                    let mut message = proxy.new_message();
                    message.requested_canceled_objects.push(identifier.clone());
                    proxy
                        .request(message, shared.policy().request_timeout)
                        .await
                        .map(drop)
                }
                Err(e) => Err(e),
            };
            if let Err(e) = canceled {
                warn!(identifier = %identifier, peer = %peer, error = %e, "Upstream did not confirm cancellation");
            }
        }

        let mut store = shared.store.lock();
        store.purge(identifier);
        shared.storage.delete_object(identifier)?;
        info!(identifier = %identifier, "Canceled replica");
        Ok(())
    }

    /// Become the home replica of an object.
    ///
    /// Obtains the lock first; the current home hands over only if it is
    /// willing to give up home status.
    pub async fn obtain_home_replica(&self, identifier: &MeshObjectIdentifier) -> Result<(), MeshError> {
        self.check_local_access(identifier, Operation::ObtainHomeReplica)?;
        let shared = &self.inner.shared;
        {
            let mut store = shared.store.lock();
            shared.swap_in(&mut store, identifier)?;
            if store.find_object(identifier)?.is_home_replica() {
                return Ok(());
            }
        }
        self.inner.coordinator.ensure_lock(identifier).await?;

        let home = shared
            .store
            .lock()
            .find_object(identifier)?
            .replica()
            .proxy_towards_home
            .clone()
            .ok_or_else(|| MeshError::Denied(identifier.clone()))?;
        let proxy = shared.proxies.obtain(&home)?;
        let mut message = proxy.new_message();
        message.requested_home_replicas.push(identifier.clone());
        proxy.request(message, shared.policy().request_timeout).await?;

        // The handover in the reply was applied before the request completed.
        if self.find_object(identifier)?.is_home_replica() {
            Ok(())
        } else {
            debug!(identifier = %identifier, peer = %home, "Home replica not handed over");
            Err(MeshError::Denied(identifier.clone()))
        }
    }
}
