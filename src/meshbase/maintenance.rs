//! Periodic upkeep: stale locks, tombstones, heartbeats, redelivery and
//! dead proxies.

use super::incoming::Inbound;
use super::NetMeshBase;
use crate::error::ConsistencyWarning;
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::mesh::ChangeSet;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    /// Objects whose lock was taken back from a silent or dead holder
    pub reclaimed: Vec<MeshObjectIdentifier>,
    /// Inconsistencies found or caused during the pass
    pub warnings: Vec<ConsistencyWarning>,
    /// Number of heartbeats sent
    pub heartbeats: usize,
    /// Dead proxies removed
    pub collected: Vec<NetworkIdentifier>,
}

impl NetMeshBase {
    /// Take back the locks of home objects whose holder went quiet.
    ///
    /// A lock is stale when the proxy towards it is dead or has not been
    /// heard from for longer than the liveness threshold. Changes the old
    /// holder made after its last message are lost; each reclaim is reported.
    pub fn reclaim_stale_locks(&self) -> (Vec<MeshObjectIdentifier>, Vec<ConsistencyWarning>) {
        let shared = &self.inner.shared;
        let threshold = shared.policy().liveness_threshold;
        let candidates: Vec<(MeshObjectIdentifier, NetworkIdentifier)> = {
            let store = shared.store.lock();
            store
                .iter()
                .filter(|o| o.is_home_replica() && !o.has_lock())
                .filter_map(|o| {
                    o.replica()
                        .proxy_towards_lock
                        .clone()
                        .map(|peer| (o.identifier().clone(), peer))
                })
                .collect()
        };

        let mut reclaimed = Vec::new();
        let mut warnings = Vec::new();
        for (identifier, holder) in candidates {
            let stale = shared
                .proxies
                .get(&holder)
                .map(|proxy| proxy.is_dead() || proxy.is_silent_for(threshold))
                .unwrap_or(false);
            if !stale {
                continue;
            }
            match self.inner.coordinator.reclaim_lock(&identifier) {
                Ok(epoch) => {
                    info!(identifier = %identifier, holder = %holder, epoch = %epoch, "Reclaimed stale lock");
                    let warning = ConsistencyWarning::new(
                        "lock reclaimed from a silent holder; its unsent changes are lost",
                    )
                    .for_object(&identifier)
                    .for_peer(&holder);
                    warning.emit();
                    warnings.push(warning);
                    reclaimed.push(identifier);
                }
                Err(e) => debug!(identifier = %identifier, error = %e, "Could not reclaim lock"),
            }
        }
        (reclaimed, warnings)
    }

    /// Remove deleted objects whose replicas did not confirm the deletion
    /// within the propagation timeout.
    pub fn sweep_tombstones(&self) -> Vec<ConsistencyWarning> {
        let shared = &self.inner.shared;
        let timeout = Duration::from_millis(shared.config.delete_propagation_timeout_ms);
        let mut store = shared.store.lock();
        let expired: Vec<(MeshObjectIdentifier, BTreeSet<NetworkIdentifier>)> = store
            .tombstones()
            .filter_map(|o| {
                o.tombstone
                    .as_ref()
                    .filter(|t| t.deleted_at.elapsed() > timeout)
                    .map(|t| (o.identifier().clone(), t.awaiting.clone()))
            })
            .collect();

        let mut warnings = Vec::new();
        for (identifier, awaiting) in expired {
            store.purge(&identifier);
            if let Err(e) = shared.storage.delete_object(&identifier) {
                warn!(identifier = %identifier, error = %e, "Failed to delete swept object");
            }
            let peers: Vec<&str> = awaiting.iter().map(|p| p.as_str()).collect();
            let warning = ConsistencyWarning::new(format!(
                "deletion not confirmed by {}",
                peers.join(", ")
            ))
            .for_object(&identifier);
            warning.emit();
            warnings.push(warning);
        }
        drop(store);
        if !warnings.is_empty() {
            shared.note_purged();
        }
        warnings
    }

    /// Send a heartbeat on every live proxy that has been idle for a
    /// heartbeat interval. Returns how many went out.
    pub fn send_heartbeats(&self) -> usize {
        let interval = self.inner.shared.policy().heartbeat_interval;
        let mut sent = 0;
        for proxy in self.proxies() {
            if proxy.is_dead() || proxy.idle_for() < interval {
                continue;
            }
            match proxy.send_heartbeat() {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %proxy.partner(), error = %e, "Heartbeat not sent"),
            }
        }
        sent
    }

    /// Have the inbound task release messages held back by a sequence gap
    /// that never closed.
    pub(crate) fn flush_stalled(&self) {
        if self.inner.inbound.send(Inbound::FlushStalled).is_err() {
            trace!(local = %self.local(), "Inbound task is gone");
        }
    }

    /// Send again the change batches that never reached their replica:
    /// batches no proxy could take, and messages left behind by dead proxies.
    /// Changes for objects that no longer replicate to the peer are dropped.
    pub async fn retry_undelivered(&self) -> Vec<ConsistencyWarning> {
        let shared = &self.inner.shared;
        let mut pending: BTreeMap<NetworkIdentifier, ChangeSet> = BTreeMap::new();
        for message in shared.proxies.take_unsent() {
            if message.changes.is_empty() || message.is_response() {
                continue;
            }
            pending
                .entry(message.receiver.clone())
                .or_default()
                .extend(message.changes);
        }
        let queued = std::mem::take(&mut *self.inner.undelivered.lock());
        for (peer, batches) in queued {
            let entry = pending.entry(peer).or_default();
            for batch in batches {
                entry.extend(batch);
            }
        }

        let batches: BTreeMap<NetworkIdentifier, ChangeSet> = {
            let store = shared.store.lock();
            pending
                .into_iter()
                .map(|(peer, changes)| {
                    let kept: ChangeSet = changes
                        .into_iter()
                        .filter(|c| store.routes_through(c.identifier(), &peer))
                        .collect();
                    (peer, kept)
                })
                .filter(|(_, changes)| !changes.is_empty())
                .collect()
        };
        if batches.is_empty() {
            return Vec::new();
        }
        info!(peers = batches.len(), "Retrying undelivered changes");
        self.propagate(batches).await
    }

    /// Drop dead proxies that no object and no queued batch refers to.
    pub fn collect_dead_proxies(&self) -> Vec<NetworkIdentifier> {
        let shared = &self.inner.shared;
        let dead: Vec<NetworkIdentifier> = self
            .proxies()
            .iter()
            .filter(|p| p.is_dead())
            .map(|p| p.partner().clone())
            .collect();
        if dead.is_empty() {
            return Vec::new();
        }
        let referenced: BTreeSet<NetworkIdentifier> = {
            let store = shared.store.lock();
            let undelivered = self.inner.undelivered.lock();
            dead.into_iter()
                .filter(|p| store.references_peer(p) || undelivered.contains_key(p))
                .collect()
        };
        let collected = shared.proxies.collect_dead(|p| referenced.contains(p));
        if !collected.is_empty() {
            debug!(proxies = collected.len(), "Collected dead proxies");
        }
        collected
    }

    /// One full maintenance pass.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.flush_stalled();
        let (reclaimed, mut warnings) = self.reclaim_stale_locks();
        warnings.extend(self.sweep_tombstones());
        warnings.extend(self.retry_undelivered().await);
        let heartbeats = self.send_heartbeats();
        let collected = self.collect_dead_proxies();
        MaintenanceReport {
            reclaimed,
            warnings,
            heartbeats,
            collected,
        }
    }

    /// Run `run_maintenance` every maintenance interval until the mesh base
    /// is dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let base = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.config().maintenance_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = base.upgrade() else {
                    break;
                };
                let report = NetMeshBase { inner }.run_maintenance().await;
                if !report.warnings.is_empty() {
                    debug!(warnings = report.warnings.len(), "Maintenance pass found inconsistencies");
                }
            }
        })
    }
}
