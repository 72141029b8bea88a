//! Inbound message processing.
//!
//! Frames from the transport are queued and handled by one task per mesh
//! base. Each proxy restores its partner's send order; the messages it
//! releases are processed here in that order, including messages released
//! late by a stalled reorder buffer. Answers that need another round trip
//! (fetching an object from further away, obtaining a lock from further
//! along, waiting for downstream replicas to confirm a deletion) are
//! completed in a spawned task so the inbound task never waits on the
//! network.

use super::{MeshBaseInner, NetMeshBase};
use crate::access::AccessSpecification;
use crate::coordinator::LockDecision;
use crate::differencer;
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::lock::LockTransfer;
use crate::mesh::{Change, ChangeKind, ChangeSet, MeshObject, ReplicaInfo};
use crate::proxy::Proxy;
use crate::security::Operation;
use crate::transport::ReceiveHandler;
use crate::xpriso::{codec, ConveyedObject, XprisoMessage};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Work for the inbound task.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(NetworkIdentifier, Vec<u8>),
    /// Release messages held back by sequence gaps past the reorder window
    FlushStalled,
}

/// Hands frames from the transport to the inbound task.
pub(crate) struct InboundQueue {
    sender: mpsc::UnboundedSender<Inbound>,
}

impl InboundQueue {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { sender }
    }
}

impl ReceiveHandler for InboundQueue {
    fn on_receive(&self, from: NetworkIdentifier, bytes: Vec<u8>) {
        if self.sender.send(Inbound::Frame(from, bytes)).is_err() {
            trace!("Mesh base is gone, dropping frame");
        }
    }
}

/// The inbound task. Ends when the mesh base is dropped.
pub(crate) async fn run(base: Weak<MeshBaseInner>, mut work: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = work.recv().await {
        let Some(inner) = base.upgrade() else {
            break;
        };
        let base = NetMeshBase { inner };
        match item {
            Inbound::Frame(from, bytes) => base.receive_frame(from, &bytes),
            Inbound::FlushStalled => base.release_stalled(),
        }
    }
}

/// Answers that wait for another round trip.
#[derive(Debug, Default)]
struct Deferred {
    first_time: Vec<AccessSpecification>,
    locks: Vec<MeshObjectIdentifier>,
    /// Deleted here, still waiting for replicas further downstream
    deletions: Vec<MeshObjectIdentifier>,
}

impl Deferred {
    fn is_empty(&self) -> bool {
        self.first_time.is_empty() && self.locks.is_empty() && self.deletions.is_empty()
    }
}

impl NetMeshBase {
    fn receive_frame(&self, from: NetworkIdentifier, bytes: &[u8]) {
        let message = match codec::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping undecodable frame");
                return;
            }
        };
        if let Err(e) = message.check() {
            warn!(peer = %from, error = %e, "Dropping malformed message");
            return;
        }
        if message.sender != from || &message.receiver != self.local() {
            warn!(
                peer = %from,
                sender = %message.sender,
                receiver = %message.receiver,
                "Dropping misaddressed message"
            );
            return;
        }

        let proxy = self.inner.shared.proxies.route_incoming(&message);
        for delivered in proxy.accept_incoming(message) {
            self.process(&proxy, delivered);
        }
    }

    /// Process what stalled reorder buffers give up, on the inbound task so
    /// it stays in order with the frames around it.
    fn release_stalled(&self) {
        for proxy in self.proxies() {
            let released = proxy.flush_stalled();
            if released.is_empty() {
                continue;
            }
            debug!(peer = %proxy.partner(), messages = released.len(), "Releasing stalled messages");
            for message in released {
                self.process(&proxy, message);
            }
        }
    }

    /// Handle one message, in the partner's send order.
    ///
    /// This runs without the single-writer gate: an open transaction may be
    /// waiting on a reply only this task delivers. Objects a transaction has
    /// staged hold their lock, so conveyed objects, changes and grants for
    /// them are refused here. Only a reclaim by the home takes the lock
    /// away, and the commit then fails its lock check and applies nothing.
    fn process(&self, proxy: &Arc<Proxy>, message: XprisoMessage) {
        let peer = message.sender.clone();
        proxy.withdraw(&message.withdrawn_requests);
        let mut reply = message.response_to();
        let mut applied = ChangeSet::new();
        let mut deferred = Deferred::default();

        self.receive_conveyed(&peer, &message.conveyed_objects, &mut applied);
        self.receive_lock_transfers(&peer, &message, &mut reply, &mut applied);
        self.receive_reclaims(&peer, &message.reclaimed_lock_objects, &mut applied);
        for transfer in &message.push_home_replicas {
            self.inner.coordinator.apply_home_transfer(&peer, transfer);
        }
        self.receive_changes(&peer, &message.changes, &mut applied);
        self.receive_cancellations(&peer, &message.requested_canceled_objects);
        if message.expects_response {
            deferred.deletions = self.unsettled_deletions(&message.changes);
        }

        for identifier in &message.requested_home_replicas {
            match self.inner.coordinator.decide_home_request(&peer, identifier) {
                Ok(transfer) => reply.push_home_replicas.push(transfer),
                Err(refusal) => reply.denied_lock_objects.push(refusal),
            }
        }
        self.answer_resynchronize(&peer, &message.requested_resynchronize_replicas, &mut reply);
        self.answer_first_time(&peer, &message.requested_first_time_objects, &mut reply, &mut deferred);
        self.answer_lock_requests(&peer, &message.requested_lock_objects, &mut reply, &mut deferred);
        self.inner.shared.emit(&applied);

        let expects_response = message.expects_response;
        let cease = message.cease_communications;
        let request_id = message.request_id;
        if message.is_response() {
            proxy.complete(message);
        }

        if cease {
            info!(peer = %peer, "Partner ceased communications");
            proxy.mark_dead();
            return;
        }
        if !expects_response {
            return;
        }
        if deferred.is_empty() {
            if let Err(e) = proxy.send_message(reply) {
                debug!(peer = %peer, error = %e, "Could not answer request");
            }
        } else {
            let base = self.clone();
            let proxy = proxy.clone();
            tokio::spawn(async move {
                base.finish_deferred(proxy, request_id, reply, deferred)
                    .await;
            });
        }
    }

    async fn finish_deferred(
        self,
        proxy: Arc<Proxy>,
        request_id: u64,
        mut reply: XprisoMessage,
        deferred: Deferred,
    ) {
        let peer = proxy.partner().clone();
        if !deferred.deletions.is_empty() && !self.settle_deletions(&deferred.deletions).await {
            // No confirmation: the partner keeps its tombstone and retries.
            debug!(peer = %peer, objects = deferred.deletions.len(), "Deletion not confirmed downstream in time");
            return;
        }
        for spec in deferred.first_time {
            let identifier = spec.object().clone();
            match self.access_locally(spec).await {
                Ok(_) => {
                    if let Some(conveyed) = self.convey_to(&peer, &identifier) {
                        reply.conveyed_objects.push(conveyed);
                    }
                }
                Err(e) => debug!(identifier = %identifier, peer = %peer, error = %e, "Could not fetch for partner"),
            }
        }

        for identifier in deferred.locks {
            let decision = self
                .inner
                .coordinator
                .forward_lock_request(&peer, &identifier, || proxy.take_withdrawn(request_id))
                .await;
            push_decision(&mut reply, &identifier, decision);
        }

        if let Err(e) = proxy.send_message(reply) {
            debug!(peer = %peer, error = %e, "Could not answer request");
        }
    }

    /// Deleted objects in `changes` whose tombstone still waits here.
    fn unsettled_deletions(&self, changes: &ChangeSet) -> Vec<MeshObjectIdentifier> {
        let store = self.inner.shared.store.lock();
        changes
            .of_kind(ChangeKind::Deleted)
            .map(|c| c.identifier())
            .filter(|id| store.is_tombstoned(id))
            .cloned()
            .collect()
    }

    /// Wait until none of `identifiers` is tombstoned any more, either
    /// confirmed downstream or swept. False if the request timeout passes first.
    async fn settle_deletions(&self, identifiers: &[MeshObjectIdentifier]) -> bool {
        let shared = &self.inner.shared;
        let mut purged = shared.purged.subscribe();
        let deadline = tokio::time::Instant::now() + shared.policy().request_timeout;
        loop {
            let waiting = {
                let store = shared.store.lock();
                identifiers.iter().any(|id| store.is_tombstoned(id))
            };
            if !waiting {
                return true;
            }
            match tokio::time::timeout_at(deadline, purged.changed()).await {
                Ok(Ok(())) => {}
                _ => return false,
            }
        }
    }

    fn receive_conveyed(
        &self,
        peer: &NetworkIdentifier,
        conveyed: &[ConveyedObject],
        applied: &mut ChangeSet,
    ) {
        if conveyed.is_empty() {
            return;
        }
        let shared = &self.inner.shared;
        let mut touched = BTreeSet::new();
        let mut store = shared.store.lock();
        for ConveyedObject { snapshot, epoch } in conveyed {
            let identifier = &snapshot.identifier;
            if let Err(e) = shared.swap_in(&mut store, identifier) {
                warn!(identifier = %identifier, error = %e, "Cannot load replica");
            }
            if let Some(object) = store.get_mut(identifier) {
                if object.replica.has_lock {
                    continue;
                }
                let changes = differencer::diff_object(Some(&object.state), Some(snapshot));
                for change in &changes {
                    change.apply_to(&mut object.state);
                }
                if epoch.is_newer_than(&object.replica.lock_epoch) {
                    object.replica.lock_epoch = epoch.clone();
                }
                if !changes.is_empty() {
                    object.touch();
                    debug!(identifier = %identifier, changes = changes.len(), "Reconciled replica");
                    applied.extend(changes);
                }
            } else if store.contains(identifier) {
                // Deleted here, waiting for confirmations.
                continue;
            } else {
                let mut replica = ReplicaInfo::replica(peer, epoch.clone());
                replica.give_up_lock = shared.config.give_up_lock;
                replica.give_up_home = shared.config.give_up_home_replica;
                store.insert_replica(MeshObject::new(snapshot.clone(), replica));
                debug!(identifier = %identifier, peer = %peer, "Installed replica");
            }
            touched.insert(identifier.clone());
        }
        shared.persist_logged(&store, &touched);
    }

    fn receive_lock_transfers(
        &self,
        peer: &NetworkIdentifier,
        message: &XprisoMessage,
        reply: &mut XprisoMessage,
        applied: &mut ChangeSet,
    ) {
        let coordinator = &self.inner.coordinator;
        let is_push = !message.is_response();
        for transfer in &message.push_lock_objects {
            let identifier = &transfer.identifier;
            match coordinator.apply_transfer(peer, transfer) {
                Some(changes) => {
                    applied.extend(changes);
                    if is_push {
                        info!(identifier = %identifier, peer = %peer, "Accepted pushed lock");
                        reply.accepted_lock_objects.push(identifier.clone());
                    }
                }
                None if !is_push => {}
                // A replayed push is acknowledged again.
                None if coordinator.holds_at(identifier, &transfer.epoch) => {
                    reply.accepted_lock_objects.push(identifier.clone());
                }
                None => reply
                    .denied_lock_objects
                    .push(coordinator.current_refusal(identifier)),
            }
        }
    }

    fn receive_reclaims(
        &self,
        peer: &NetworkIdentifier,
        reclaims: &[LockTransfer],
        applied: &mut ChangeSet,
    ) {
        let coordinator = &self.inner.coordinator;
        for transfer in reclaims {
            if let Some((changes, downstream)) = coordinator.apply_reclaim(peer, transfer) {
                applied.extend(changes);
                if let Some(next) = downstream {
                    coordinator.send_reclaim(&next, transfer.clone());
                }
            }
        }
    }

    /// Apply changes from the lock's direction and pass them on to every
    /// other replica proxy. Changes from elsewhere come from a replica that
    /// missed a reclaim; the home tells it again.
    fn receive_changes(&self, peer: &NetworkIdentifier, changes: &ChangeSet, applied: &mut ChangeSet) {
        if changes.is_empty() {
            return;
        }
        let shared = &self.inner.shared;
        let mut forward: BTreeMap<NetworkIdentifier, ChangeSet> = BTreeMap::new();
        let mut rejected = BTreeSet::new();
        {
            let mut store = shared.store.lock();
            let mut touched = BTreeSet::new();
            for change in changes {
                let identifier = change.identifier().clone();
                if let Err(e) = shared.swap_in(&mut store, &identifier) {
                    warn!(identifier = %identifier, error = %e, "Cannot load replica");
                }
                let Some(object) = store.get(&identifier) else {
                    trace!(identifier = %identifier, "No replica for change");
                    continue;
                };
                if !object.replica().accepts_changes_from(peer) {
                    rejected.insert(identifier);
                    continue;
                }
                let operation = match change {
                    Change::Deleted { .. } => Operation::Delete,
                    _ => Operation::Write,
                };
                if !shared.permitted(peer, &identifier, operation) {
                    warn!(identifier = %identifier, peer = %peer, "Change not permitted");
                    continue;
                }
                let targets = object.replica().proxies_except(Some(peer));
                if store.apply_remote(peer, change) {
                    applied.push(change.clone());
                    for target in targets {
                        forward.entry(target).or_default().push(change.clone());
                    }
                    touched.insert(identifier);
                }
            }
            shared.persist_logged(&store, &touched);
        }

        for identifier in rejected {
            debug!(identifier = %identifier, peer = %peer, "Rejected change from outside the lock direction");
            if let Some(transfer) = self.inner.coordinator.home_lock_state(&identifier) {
                self.inner.coordinator.send_reclaim(peer, transfer);
            }
        }
        if forward.is_empty() {
            return;
        }
        let (_, confirmations) = self.dispatch(forward);
        if !confirmations.is_empty() {
            let base = self.clone();
            tokio::spawn(async move {
                base.confirm(confirmations).await;
            });
        }
    }

    fn receive_cancellations(&self, peer: &NetworkIdentifier, canceled: &[MeshObjectIdentifier]) {
        if canceled.is_empty() {
            return;
        }
        let shared = &self.inner.shared;
        let mut purged = false;
        {
            let mut store = shared.store.lock();
            let mut touched = Vec::new();
            for identifier in canceled {
                if let Some(object) = store.get_mut(identifier) {
                    if object.replica.proxies_with_copies.remove(peer) {
                        debug!(identifier = %identifier, peer = %peer, "Replica canceled");
                        touched.push(identifier.clone());
                    }
                } else if store.is_tombstoned(identifier) {
                    purged |= store.acknowledge_deletion(identifier, peer);
                }
            }
            shared.persist_logged(&store, &touched);
        }
        if purged {
            shared.note_purged();
        }
    }

    fn answer_resynchronize(
        &self,
        peer: &NetworkIdentifier,
        requested: &[MeshObjectIdentifier],
        reply: &mut XprisoMessage,
    ) {
        let shared = &self.inner.shared;
        for identifier in requested {
            if !shared.permitted(peer, identifier, Operation::Read) {
                reply.refused_objects.push(identifier.clone());
                continue;
            }
            let mut store = shared.store.lock();
            if let Err(e) = shared.swap_in(&mut store, identifier) {
                warn!(identifier = %identifier, error = %e, "Cannot load replica");
            }
            if let Some(object) = store.get(identifier) {
                reply.conveyed_objects.push(ConveyedObject {
                    snapshot: object.snapshot().clone(),
                    epoch: object.lock_epoch().clone(),
                });
            }
        }
    }

    fn answer_first_time(
        &self,
        peer: &NetworkIdentifier,
        requested: &[AccessSpecification],
        reply: &mut XprisoMessage,
        deferred: &mut Deferred,
    ) {
        for spec in requested {
            let spec = spec.relative_to(self.local());
            let identifier = spec.object().clone();
            if !self.inner.shared.permitted(peer, &identifier, Operation::Read) {
                debug!(identifier = %identifier, peer = %peer, "Replica not permitted");
                reply.refused_objects.push(identifier);
                continue;
            }
            if let Some(conveyed) = self.convey_to(peer, &identifier) {
                reply.conveyed_objects.push(conveyed);
                continue;
            }
            match spec.first_hop() {
                Some(hop) if hop != self.local() && hop != peer => deferred.first_time.push(spec),
                _ => debug!(identifier = %identifier, peer = %peer, "Requested object unknown here"),
            }
        }
    }

    fn answer_lock_requests(
        &self,
        peer: &NetworkIdentifier,
        requested: &[MeshObjectIdentifier],
        reply: &mut XprisoMessage,
        deferred: &mut Deferred,
    ) {
        for identifier in requested {
            match self.inner.coordinator.decide_lock_request(peer, identifier) {
                LockDecision::Forward => deferred.locks.push(identifier.clone()),
                decision => push_decision(reply, identifier, decision),
            }
        }
    }
}

fn push_decision(reply: &mut XprisoMessage, identifier: &MeshObjectIdentifier, decision: LockDecision) {
    match decision {
        LockDecision::Grant(transfer) => {
            reply.accepted_lock_objects.push(identifier.clone());
            reply.push_lock_objects.push(transfer);
        }
        LockDecision::Deny(refusal) => reply.denied_lock_objects.push(refusal),
        LockDecision::Forward => {}
    }
}
