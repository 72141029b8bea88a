//! Committing transactions and sending their changes to other replicas.

use super::{NetMeshBase, WriteGate};
use crate::error::{ConsistencyWarning, MeshError};
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::mesh::{Change, ChangeKind, ChangeSet, TransactionToken};
use crate::proxy::{Proxy, QueuedRequest};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a committed transaction.
///
/// The changes are in effect locally either way; warnings name replicas that
/// may not have received them yet. Their batches are queued for
/// `retry_undelivered`.
#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    pub changes: ChangeSet,
    pub warnings: Vec<ConsistencyWarning>,
}

impl CommitReport {
    /// Whether every replica took the changes.
    pub fn is_fully_propagated(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Split `changes` into one ordered batch per replica proxy.
pub(crate) fn batches_for(
    changes: &ChangeSet,
    targets: &BTreeMap<MeshObjectIdentifier, BTreeSet<NetworkIdentifier>>,
) -> BTreeMap<NetworkIdentifier, ChangeSet> {
    let mut batches: BTreeMap<NetworkIdentifier, ChangeSet> = BTreeMap::new();
    for change in changes {
        let Some(peers) = targets.get(change.identifier()) else {
            continue;
        };
        for peer in peers {
            batches.entry(peer.clone()).or_default().push(change.clone());
        }
    }
    batches
}

/// A deletion batch waiting for the replica to confirm it.
pub(crate) struct Confirmation {
    proxy: Arc<Proxy>,
    queued: QueuedRequest,
    batch: ChangeSet,
}

fn has_deletions(batch: &ChangeSet) -> bool {
    batch.of_kind(ChangeKind::Deleted).next().is_some()
}

impl NetMeshBase {
    /// Apply a transaction's changes, persist them and send them on.
    ///
    /// Every object changed must hold its lock, except objects the
    /// transaction created. Nothing is applied if any change fails or
    /// storage refuses the result.
    pub(crate) async fn commit_changes(
        &self,
        token: &TransactionToken,
        changes: ChangeSet,
        created: &BTreeSet<MeshObjectIdentifier>,
        gate: WriteGate,
    ) -> Result<CommitReport, MeshError> {
        if changes.is_empty() {
            return Ok(CommitReport::default());
        }
        let shared = &self.inner.shared;
        let affected = changes.affected_identifiers();

        let targets = {
            let mut store = shared.store.lock();
            for change in &changes {
                let identifier = change.identifier();
                match change {
                    Change::Created { .. } => {
                        if store.contains(identifier) {
                            return Err(MeshError::IdentifierInUse(identifier.clone()));
                        }
                    }
                    _ if created.contains(identifier) => {}
                    _ => {
                        if !store.find_object(identifier)?.has_lock() {
                            return Err(MeshError::LockRequired(identifier.clone()));
                        }
                    }
                }
            }

            let targets: BTreeMap<MeshObjectIdentifier, BTreeSet<NetworkIdentifier>> = affected
                .iter()
                .filter_map(|id| store.get(id).map(|o| (id.clone(), o.replica().all_proxies())))
                .filter(|(_, peers)| !peers.is_empty())
                .collect();
            let checkpoint = store.checkpoint(&affected);

            let applied = changes
                .iter()
                .try_for_each(|change| store.mutate(token, change));
            if applied.is_ok() {
                for identifier in created {
                    if let Some(object) = store.get_mut(identifier) {
                        object.replica.give_up_lock = shared.config.give_up_lock;
                        object.replica.give_up_home = shared.config.give_up_home_replica;
                    }
                }
            }
            let result = applied.and_then(|_| shared.persist(&store, &affected).map_err(MeshError::from));
            if let Err(e) = result {
                store.restore(checkpoint);
                shared.persist_logged(&store, &affected);
                debug!(local = %shared.local, error = %e, "Commit rolled back");
                return Err(e);
            }
            targets
        };
        drop(gate);

        info!(
            local = %shared.local,
            changes = changes.len(),
            objects = affected.len(),
            "Committed transaction"
        );
        shared.emit(&changes);

        let warnings = self.propagate(batches_for(&changes, &targets)).await;
        Ok(CommitReport { changes, warnings })
    }

    /// Send one batch per peer and wait for the deletion confirmations.
    pub(crate) async fn propagate(
        &self,
        batches: BTreeMap<NetworkIdentifier, ChangeSet>,
    ) -> Vec<ConsistencyWarning> {
        let (mut warnings, confirmations) = self.dispatch(batches);
        warnings.extend(self.confirm(confirmations).await);
        warnings
    }

    /// Queue one batch per peer, in order with everything sent before.
    /// Batches with deletions go out as requests so the tombstones can be
    /// dropped once every replica confirmed.
    pub(crate) fn dispatch(
        &self,
        batches: BTreeMap<NetworkIdentifier, ChangeSet>,
    ) -> (Vec<ConsistencyWarning>, Vec<Confirmation>) {
        let mut warnings = Vec::new();
        let mut confirmations = Vec::new();
        for (peer, batch) in batches {
            let proxy = match self.inner.shared.proxies.obtain(&peer) {
                Ok(proxy) => proxy,
                Err(e) => {
                    warnings.push(self.undeliverable(&peer, batch, &e));
                    continue;
                }
            };
            let mut message = proxy.new_message();
            message.changes = batch.clone();
            let sent = if has_deletions(&batch) {
                proxy.queue_request(message).map(|queued| {
                    confirmations.push(Confirmation {
                        proxy: proxy.clone(),
                        queued,
                        batch: batch.clone(),
                    });
                })
            } else {
                proxy.send_message(message)
            };
            if let Err(e) = sent {
                warnings.push(self.undeliverable(&peer, batch, &e));
            }
        }
        (warnings, confirmations)
    }

    pub(crate) async fn confirm(&self, confirmations: Vec<Confirmation>) -> Vec<ConsistencyWarning> {
        let timeout = self.inner.shared.policy().request_timeout;
        let outcomes = join_all(confirmations.into_iter().map(|confirmation| async move {
            let Confirmation {
                proxy,
                queued,
                batch,
            } = confirmation;
            let outcome = proxy.wait_for(queued, timeout).await;
            (proxy, batch, outcome)
        }))
        .await;

        let mut warnings = Vec::new();
        for (proxy, batch, outcome) in outcomes {
            match outcome {
                Ok(_) => self.acknowledge_deletions(proxy.partner(), &batch),
                Err(e) => warnings.push(self.undeliverable(proxy.partner(), batch, &e)),
            }
        }
        warnings
    }

    /// Queue a batch `peer` did not take and report it.
    fn undeliverable(&self, peer: &NetworkIdentifier, batch: ChangeSet, err: &MeshError) -> ConsistencyWarning {
        let mut warning = ConsistencyWarning::new(format!(
            "{} change(s) not delivered: {}",
            batch.len(),
            err
        ))
        .for_peer(peer);
        let objects = batch.affected_identifiers();
        if objects.len() == 1 {
            if let Some(identifier) = objects.iter().next() {
                warning = warning.for_object(identifier);
            }
        }
        warning.emit();
        self.inner
            .undelivered
            .lock()
            .entry(peer.clone())
            .or_default()
            .push(batch);
        warning
    }

    /// `peer` confirmed the deletions in `batch`.
    pub(crate) fn acknowledge_deletions(&self, peer: &NetworkIdentifier, batch: &ChangeSet) {
        let shared = &self.inner.shared;
        let mut purged = false;
        {
            let mut store = shared.store.lock();
            for change in batch.of_kind(ChangeKind::Deleted) {
                if store.acknowledge_deletion(change.identifier(), peer) {
                    debug!(identifier = %change.identifier(), "Deletion confirmed by every replica");
                    purged = true;
                }
            }
        }
        if purged {
            shared.note_purged();
        }
    }
}
