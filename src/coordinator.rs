//! Access/Lock coordinator
//!
//! Decides whether a local write may proceed or must first obtain the lock,
//! answers lock and home-replica requests from other mesh bases, and applies
//! lock transfers and reclaims that arrive from them.
//!
//! The lock of an object travels along the replication tree. A replica that
//! hands the lock on remembers where it went (`proxy_towards_lock`), so a
//! request for it can always follow `proxy_towards_lock`, falling back to
//! `proxy_towards_home`, until it reaches the holder.

use crate::differencer;
use crate::error::{LockFailure, MeshError};
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::lock::{LockEpoch, LockRefusal, LockReply, LockTransfer, PushOutcome};
use crate::mesh::{ChangeSet, MeshObject};
use crate::meshbase::shared::Shared;
use crate::security::Operation;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How to answer an inbound lock request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LockDecision {
    Grant(LockTransfer),
    Deny(LockRefusal),
    /// The lock is further along; obtain it first, then decide again.
    Forward,
}

#[derive(Clone)]
pub struct LockCoordinator {
    shared: Arc<Shared>,
}

fn unavailable(identifier: &MeshObjectIdentifier, cause: LockFailure) -> MeshError {
    MeshError::LockUnavailable {
        identifier: identifier.clone(),
        cause,
    }
}

/// Proxy failures while asking for a lock become lock failures.
fn lock_error(identifier: &MeshObjectIdentifier, err: MeshError) -> MeshError {
    match err {
        MeshError::ProxyUnreachable(_) => unavailable(identifier, LockFailure::ProxyUnreachable),
        MeshError::ProxyDead(_) => unavailable(identifier, LockFailure::ProxyDead),
        MeshError::Timeout(_) => unavailable(identifier, LockFailure::Timeout),
        other => other,
    }
}

fn transfer_of(object: &MeshObject) -> LockTransfer {
    LockTransfer {
        identifier: object.identifier().clone(),
        epoch: object.lock_epoch().clone(),
        snapshot: Some(object.snapshot().clone()),
    }
}

impl LockCoordinator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn refusal(&self, identifier: &MeshObjectIdentifier, epoch: Option<&LockEpoch>) -> LockRefusal {
        LockRefusal {
            identifier: identifier.clone(),
            epoch: epoch
                .cloned()
                .unwrap_or_else(|| LockEpoch::initial(&self.shared.local)),
        }
    }

    /// A refusal carrying the local epoch of `identifier`.
    pub(crate) fn current_refusal(&self, identifier: &MeshObjectIdentifier) -> LockRefusal {
        let epoch = self
            .shared
            .store
            .lock()
            .get(identifier)
            .map(|o| o.lock_epoch().clone());
        self.refusal(identifier, epoch.as_ref())
    }

    /// Make sure the local replica of `identifier` holds the lock, asking the
    /// replica in the lock's direction if it does not.
    ///
    /// Never queues: a refused or unanswered request fails with
    /// `LockUnavailable` and the caller decides whether to retry.
    pub async fn ensure_lock(&self, identifier: &MeshObjectIdentifier) -> Result<(), MeshError> {
        let route = {
            let mut store = self.shared.store.lock();
            self.shared.swap_in(&mut store, identifier)?;
            let object = store.find_object(identifier)?;
            if object.has_lock() {
                return Ok(());
            }
            if object.is_shadow() {
                return Err(unavailable(identifier, LockFailure::NoRoute));
            }
            object.replica().route_towards_lock().cloned()
        };
        let peer = route.ok_or_else(|| unavailable(identifier, LockFailure::NoRoute))?;

        debug!(identifier = %identifier, peer = %peer, "Requesting lock");
        let proxy = self.shared.proxies.obtain(&peer)?;
        let reply = proxy
            .request_lock(identifier, self.shared.policy().lock_timeout)
            .await
            .map_err(|e| lock_error(identifier, e))?;

        match reply {
            LockReply::Granted(epoch) => {
                // The transfer in the reply was applied before the request completed.
                let holds = self
                    .shared
                    .store
                    .lock()
                    .get(identifier)
                    .map(|o| o.has_lock())
                    .unwrap_or(false);
                if holds {
                    info!(identifier = %identifier, epoch = %epoch, "Obtained lock");
                    Ok(())
                } else {
                    debug!(identifier = %identifier, epoch = %epoch, "Grant was stale on arrival");
                    Err(unavailable(identifier, LockFailure::Denied))
                }
            }
            LockReply::Denied(epoch) => {
                debug!(
                    identifier = %identifier,
                    epoch = ?epoch.map(|e| e.to_string()),
                    "Lock request denied"
                );
                Err(unavailable(identifier, LockFailure::Denied))
            }
        }
    }

    /// Decide an inbound lock request from `from`.
    ///
    /// A holder grants at once when it may give the lock up and the object is
    /// not part of the open transaction, so the first request to arrive wins.
    /// Replicas without the lock, the home included, forward towards it; a
    /// proxy carries one transfer per object at a time, so concurrent
    /// forwards for the same object are denied.
    pub(crate) fn decide_lock_request(
        &self,
        from: &NetworkIdentifier,
        identifier: &MeshObjectIdentifier,
    ) -> LockDecision {
        if !self.shared.permitted(from, identifier, Operation::ObtainLock) {
            debug!(identifier = %identifier, peer = %from, "Lock request not permitted");
            return LockDecision::Deny(self.refusal(identifier, None));
        }

        let mut store = self.shared.store.lock();
        if let Err(e) = self.shared.swap_in(&mut store, identifier) {
            warn!(identifier = %identifier, error = %e, "Cannot load object for lock request");
        }
        let pinned = self.shared.is_pinned(identifier);
        let local = self.shared.local.clone();
        let Some(object) = store.get_mut(identifier) else {
            return LockDecision::Deny(self.refusal(identifier, None));
        };
        let replica = &mut object.replica;

        if replica.has_lock {
            if !replica.give_up_lock || pinned || !replica.all_proxies().contains(from) {
                debug!(
                    identifier = %identifier,
                    peer = %from,
                    pinned,
                    "Holder keeps the lock"
                );
                return LockDecision::Deny(self.refusal(identifier, Some(&replica.lock_epoch)));
            }
            let epoch = replica.lock_epoch.next(&local);
            replica.has_lock = false;
            replica.lock_epoch = epoch.clone();
            replica.proxy_towards_lock = Some(from.clone());
            let transfer = transfer_of(object);
            self.shared.persist_logged(&store, [identifier]);
            info!(identifier = %identifier, peer = %from, epoch = %epoch, "Granted lock");
            return LockDecision::Grant(transfer);
        }

        if replica.is_shadow() {
            return LockDecision::Deny(self.refusal(identifier, Some(&replica.lock_epoch)));
        }
        match replica.route_towards_lock() {
            Some(next) if next != from => LockDecision::Forward,
            _ => LockDecision::Deny(self.refusal(identifier, Some(&replica.lock_epoch))),
        }
    }

    /// Obtain the lock from further along on behalf of `from`, then grant it,
    /// unless `from` gave up waiting in the meantime.
    pub(crate) async fn forward_lock_request<F>(
        &self,
        from: &NetworkIdentifier,
        identifier: &MeshObjectIdentifier,
        withdrawn: F,
    ) -> LockDecision
    where
        F: FnOnce() -> bool,
    {
        if let Err(e) = self.ensure_lock(identifier).await {
            debug!(identifier = %identifier, peer = %from, error = %e, "Could not obtain lock to pass on");
            return LockDecision::Deny(self.current_refusal(identifier));
        }
        if withdrawn() {
            debug!(identifier = %identifier, peer = %from, "Requester withdrew, keeping lock");
            return LockDecision::Deny(self.refusal(identifier, None));
        }
        match self.decide_lock_request(from, identifier) {
            LockDecision::Forward => LockDecision::Deny(self.refusal(identifier, None)),
            decision => decision,
        }
    }

    /// Apply a granted or pushed lock. Transfers that are not newer than what
    /// is known locally are discarded, which makes replays harmless. Returns
    /// the changes the carried snapshot brought, if the transfer was applied.
    pub(crate) fn apply_transfer(
        &self,
        from: &NetworkIdentifier,
        transfer: &LockTransfer,
    ) -> Option<ChangeSet> {
        let identifier = &transfer.identifier;
        let mut store = self.shared.store.lock();
        let object = store.get_mut(identifier)?;
        if !object.replica.references(from) {
            warn!(identifier = %identifier, peer = %from, "Lock transfer from a non-adjacent replica");
            return None;
        }
        if !transfer.epoch.is_newer_than(&object.replica.lock_epoch) {
            debug!(
                identifier = %identifier,
                epoch = %transfer.epoch,
                known = %object.replica.lock_epoch,
                "Discarding stale lock transfer"
            );
            return None;
        }

        let changes = match &transfer.snapshot {
            Some(snapshot) => differencer::diff_object(Some(&object.state), Some(snapshot)),
            None => ChangeSet::new(),
        };
        for change in &changes {
            change.apply_to(&mut object.state);
        }
        if !changes.is_empty() {
            object.touch();
        }
        object.replica.has_lock = true;
        object.replica.lock_epoch = transfer.epoch.clone();
        object.replica.proxy_towards_lock = None;
        self.shared.persist_logged(&store, [identifier]);
        debug!(identifier = %identifier, peer = %from, epoch = %transfer.epoch, "Lock arrived");
        Some(changes)
    }

    /// Whether the local replica holds the lock at exactly `epoch`.
    pub(crate) fn holds_at(&self, identifier: &MeshObjectIdentifier, epoch: &LockEpoch) -> bool {
        self.shared
            .store
            .lock()
            .get(identifier)
            .map(|o| o.has_lock() && o.lock_epoch() == epoch)
            .unwrap_or(false)
    }

    /// Apply a reclaim sent by the home. Returns the changes the home's
    /// snapshot brought and the replica the lock had been passed on to.
    pub(crate) fn apply_reclaim(
        &self,
        from: &NetworkIdentifier,
        transfer: &LockTransfer,
    ) -> Option<(ChangeSet, Option<NetworkIdentifier>)> {
        let identifier = &transfer.identifier;
        let mut store = self.shared.store.lock();
        let object = store.get_mut(identifier)?;
        if object.replica.is_home_replica || !object.replica.references(from) {
            debug!(identifier = %identifier, peer = %from, "Ignoring reclaim");
            return None;
        }
        if !transfer.epoch.is_newer_than(&object.replica.lock_epoch) {
            debug!(identifier = %identifier, epoch = %transfer.epoch, "Discarding stale reclaim");
            return None;
        }

        let changes = match &transfer.snapshot {
            Some(snapshot) => differencer::diff_object(Some(&object.state), Some(snapshot)),
            None => ChangeSet::new(),
        };
        for change in &changes {
            change.apply_to(&mut object.state);
        }
        if !changes.is_empty() {
            object.touch();
        }
        let was_holder = object.replica.has_lock;
        object.replica.has_lock = false;
        object.replica.lock_epoch = transfer.epoch.clone();
        let downstream = object
            .replica
            .proxy_towards_lock
            .take()
            .filter(|next| next != from);
        self.shared.persist_logged(&store, [identifier]);
        if was_holder {
            warn!(identifier = %identifier, epoch = %transfer.epoch, "Lock reclaimed by home replica");
        }
        Some((changes, downstream))
    }

    /// Hand the lock of `identifier` to the adjacent replica `peer`.
    ///
    /// The lock is given up before the push goes out. A `Nack` restores it
    /// unless something else happened to the lock meanwhile. A push that is
    /// never answered leaves the lock with nobody known; the home recovers it
    /// with `reclaim_lock`.
    pub async fn push_lock(
        &self,
        identifier: &MeshObjectIdentifier,
        peer: &NetworkIdentifier,
    ) -> Result<PushOutcome, MeshError> {
        let (transfer, epoch) = {
            let mut store = self.shared.store.lock();
            self.shared.swap_in(&mut store, identifier)?;
            let object = store
                .get_mut(identifier)
                .ok_or_else(|| MeshError::NotFound(identifier.clone()))?;
            if !object.replica.has_lock {
                return Err(MeshError::LockRequired(identifier.clone()));
            }
            if !object.replica.give_up_lock || self.shared.is_pinned(identifier) {
                return Err(MeshError::Denied(identifier.clone()));
            }
            if !object.replica.all_proxies().contains(peer) {
                return Err(MeshError::NotPermitted {
                    caller: peer.clone(),
                    identifier: identifier.clone(),
                    operation: Operation::ObtainLock,
                });
            }
            let epoch = object.replica.lock_epoch.next(&self.shared.local);
            object.replica.has_lock = false;
            object.replica.lock_epoch = epoch.clone();
            object.replica.proxy_towards_lock = Some(peer.clone());
            let transfer = transfer_of(object);
            self.shared.persist_logged(&store, [identifier]);
            (transfer, epoch)
        };

        let proxy = match self.shared.proxies.obtain(peer) {
            Ok(proxy) => proxy,
            Err(e) => {
                self.restore_lock(identifier, &epoch);
                return Err(e);
            }
        };
        match proxy
            .push_lock(transfer, self.shared.policy().lock_timeout)
            .await
        {
            Ok(PushOutcome::Ack) => {
                info!(identifier = %identifier, peer = %peer, epoch = %epoch, "Pushed lock");
                Ok(PushOutcome::Ack)
            }
            Ok(PushOutcome::Nack) => {
                debug!(identifier = %identifier, peer = %peer, "Lock push refused");
                self.restore_lock(identifier, &epoch);
                Ok(PushOutcome::Nack)
            }
            Err(e) if e.lock_failure() == Some(LockFailure::InFlight) => {
                self.restore_lock(identifier, &epoch);
                Err(e)
            }
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    peer = %peer,
                    error = %e,
                    "Lock push unconfirmed; the home replica can reclaim it"
                );
                Err(lock_error(identifier, e))
            }
        }
    }

    fn restore_lock(&self, identifier: &MeshObjectIdentifier, epoch: &LockEpoch) {
        let mut store = self.shared.store.lock();
        let Some(object) = store.get_mut(identifier) else {
            return;
        };
        if object.replica.has_lock || &object.replica.lock_epoch != epoch {
            return;
        }
        object.replica.has_lock = true;
        object.replica.proxy_towards_lock = None;
        self.shared.persist_logged(&store, [identifier]);
    }

    /// Take the lock back without the holder's consent. Home replicas only.
    ///
    /// The reclaim is sent best-effort towards the old holder; replicas that
    /// miss it find out when the home rejects their changes.
    pub fn reclaim_lock(&self, identifier: &MeshObjectIdentifier) -> Result<LockEpoch, MeshError> {
        let (transfer, holder) = {
            let mut store = self.shared.store.lock();
            self.shared.swap_in(&mut store, identifier)?;
            let object = store
                .get_mut(identifier)
                .ok_or_else(|| MeshError::NotFound(identifier.clone()))?;
            if !object.replica.is_home_replica {
                return Err(MeshError::NotHomeReplica(identifier.clone()));
            }
            if object.replica.has_lock {
                return Ok(object.replica.lock_epoch.clone());
            }
            object.replica.lock_epoch = object.replica.lock_epoch.reclaimed(&self.shared.local);
            object.replica.has_lock = true;
            let holder = object.replica.proxy_towards_lock.take();
            let transfer = transfer_of(object);
            self.shared.persist_logged(&store, [identifier]);
            (transfer, holder)
        };

        info!(
            identifier = %identifier,
            epoch = %transfer.epoch,
            holder = ?holder.as_ref().map(|h| h.as_str()),
            "Reclaimed lock"
        );
        let epoch = transfer.epoch.clone();
        if let Some(holder) = holder {
            self.send_reclaim(&holder, transfer);
        }
        Ok(epoch)
    }

    /// Tell `peer` the home holds the lock at the current epoch.
    pub(crate) fn send_reclaim(&self, peer: &NetworkIdentifier, transfer: LockTransfer) {
        let sent = self.shared.proxies.obtain(peer).and_then(|proxy| {
            let mut message = proxy.new_message();
            message.reclaimed_lock_objects.push(transfer);
            proxy.send_message(message)
        });
        if let Err(e) = sent {
            debug!(peer = %peer, error = %e, "Reclaim not sent");
        }
    }

    /// The home's current lock state of `identifier`, to correct a replica
    /// that still writes as if it held the lock.
    pub(crate) fn home_lock_state(&self, identifier: &MeshObjectIdentifier) -> Option<LockTransfer> {
        let store = self.shared.store.lock();
        let object = store.get(identifier)?;
        (object.is_home_replica() && object.has_lock()).then(|| transfer_of(object))
    }

    /// Decide an inbound request from `from` to become the home replica.
    ///
    /// Handed over only when home status may be given up and `from` already
    /// holds the lock through us. A repeated request after a handover is
    /// answered the same way.
    pub(crate) fn decide_home_request(
        &self,
        from: &NetworkIdentifier,
        identifier: &MeshObjectIdentifier,
    ) -> Result<LockTransfer, LockRefusal> {
        if !self
            .shared
            .permitted(from, identifier, Operation::ObtainHomeReplica)
        {
            return Err(self.refusal(identifier, None));
        }
        let mut store = self.shared.store.lock();
        let Some(object) = store.get_mut(identifier) else {
            return Err(self.refusal(identifier, None));
        };
        let replica = &mut object.replica;
        let handover = LockTransfer {
            identifier: identifier.clone(),
            epoch: replica.lock_epoch.clone(),
            snapshot: None,
        };

        if !replica.is_home_replica && replica.proxy_towards_home.as_ref() == Some(from) {
            return Ok(handover);
        }
        let lock_is_with_requester = !replica.has_lock && replica.proxy_towards_lock.as_ref() == Some(from);
        if !replica.is_home_replica || !replica.give_up_home || !lock_is_with_requester {
            debug!(identifier = %identifier, peer = %from, "Keeping home replica");
            return Err(self.refusal(identifier, Some(&replica.lock_epoch)));
        }

        replica.is_home_replica = false;
        replica.proxy_towards_home = Some(from.clone());
        replica.proxy_towards_lock = None;
        replica.proxies_with_copies.remove(from);
        self.shared.persist_logged(&store, [identifier]);
        info!(identifier = %identifier, peer = %from, "Handed over home replica");
        Ok(handover)
    }

    /// Become the home replica after the old home handed it over.
    pub(crate) fn apply_home_transfer(&self, from: &NetworkIdentifier, transfer: &LockTransfer) -> bool {
        let identifier = &transfer.identifier;
        let mut store = self.shared.store.lock();
        let Some(object) = store.get_mut(identifier) else {
            return false;
        };
        let replica = &mut object.replica;
        if replica.is_home_replica || replica.proxy_towards_home.as_ref() != Some(from) {
            return false;
        }
        replica.is_home_replica = true;
        replica.proxy_towards_home = None;
        replica.proxies_with_copies.insert(from.clone());
        if transfer.epoch.is_newer_than(&replica.lock_epoch) {
            replica.lock_epoch = transfer.epoch.clone();
        }
        self.shared.persist_logged(&store, [identifier]);
        info!(identifier = %identifier, "Became home replica");
        true
    }
}
