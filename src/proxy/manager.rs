//! Proxy manager: one live proxy per partner, created on demand.

use crate::error::MeshError;
use crate::identifier::NetworkIdentifier;
use crate::proxy::peer::Proxy;
use crate::proxy::policy::ProxyPolicy;
use crate::transport::Transport;
use crate::xpriso::XprisoMessage;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ProxyManager {
    local: NetworkIdentifier,
    transport: Arc<dyn Transport>,
    policy: ProxyPolicy,
    proxies: RwLock<HashMap<NetworkIdentifier, Arc<Proxy>>>,
    last_session: AtomicU64,
    orphaned: Mutex<Vec<XprisoMessage>>,
}

impl ProxyManager {
    pub fn new(local: NetworkIdentifier, transport: Arc<dyn Transport>, policy: ProxyPolicy) -> Self {
        Self {
            local,
            transport,
            policy,
            proxies: RwLock::new(HashMap::new()),
            last_session: AtomicU64::new(0),
            orphaned: Mutex::new(Vec::new()),
        }
    }

    pub fn local(&self) -> &NetworkIdentifier {
        &self.local
    }

    pub fn policy(&self) -> &ProxyPolicy {
        &self.policy
    }

    /// Sessions are wall-clock based so a restarted mesh base starts above its
    /// previous sessions, and strictly increasing within this process.
    fn next_session(&self) -> u64 {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n.max(0) as u64)
            .unwrap_or_default();
        let previous = self
            .last_session
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_default();
        now.max(previous + 1)
    }

    fn create(&self, partner: &NetworkIdentifier) -> Arc<Proxy> {
        let session = self.next_session();
        debug!(local = %self.local, peer = %partner, session, "Creating proxy");
        Proxy::spawn(
            self.local.clone(),
            partner.clone(),
            session,
            self.policy,
            self.transport.clone(),
        )
    }

    fn retire(&self, proxy: &Proxy) {
        let unsent = proxy.take_unsent();
        if !unsent.is_empty() {
            self.orphaned.lock().extend(unsent);
        }
    }

    /// The live proxy towards `partner`, creating or replacing it as needed.
    pub fn obtain(&self, partner: &NetworkIdentifier) -> Result<Arc<Proxy>, MeshError> {
        if partner == &self.local {
            return Err(MeshError::Protocol(format!(
                "{} cannot open a proxy to itself",
                self.local
            )));
        }
        if let Some(proxy) = self.proxies.read().get(partner) {
            if !proxy.is_dead() {
                return Ok(proxy.clone());
            }
        }

        let mut proxies = self.proxies.write();
        if let Some(existing) = proxies.get(partner) {
            if !existing.is_dead() {
                return Ok(existing.clone());
            }
            self.retire(existing);
        }
        let proxy = self.create(partner);
        proxies.insert(partner.clone(), proxy.clone());
        Ok(proxy)
    }

    pub fn get(&self, partner: &NetworkIdentifier) -> Option<Arc<Proxy>> {
        self.proxies.read().get(partner).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Proxy>> {
        self.proxies.read().values().cloned().collect()
    }

    /// The proxy that should receive `message`.
    ///
    /// A message from a newer session than the one the current proxy follows
    /// means the partner dropped its side; the current proxy is replaced so
    /// both directions restart their numbering.
    pub fn route_incoming(&self, message: &XprisoMessage) -> Arc<Proxy> {
        let mut proxies = self.proxies.write();
        if let Some(existing) = proxies.get(&message.sender) {
            let following = existing.inbound_session();
            let same_conversation = following == 0 || message.session <= following;
            if !existing.is_dead() && same_conversation {
                return existing.clone();
            }
            if !existing.is_dead() {
                info!(
                    peer = %message.sender,
                    session = message.session,
                    "Partner restarted its session, replacing proxy"
                );
                existing.mark_dead();
            }
            self.retire(existing);
        }
        let proxy = self.create(&message.sender);
        proxies.insert(message.sender.clone(), proxy.clone());
        proxy
    }

    /// Messages that dead proxies never sent, for redelivery.
    pub fn take_unsent(&self) -> Vec<XprisoMessage> {
        let mut unsent = std::mem::take(&mut *self.orphaned.lock());
        for proxy in self.proxies.read().values() {
            if proxy.is_dead() {
                unsent.extend(proxy.take_unsent());
            }
        }
        unsent
    }

    /// Drop dead proxies nothing refers to any more.
    pub fn collect_dead<F>(&self, referenced: F) -> Vec<NetworkIdentifier>
    where
        F: Fn(&NetworkIdentifier) -> bool,
    {
        let mut removed = Vec::new();
        let mut proxies = self.proxies.write();
        proxies.retain(|partner, proxy| {
            let keep = !proxy.is_dead() || referenced(partner);
            if !keep {
                let unsent = proxy.take_unsent();
                if !unsent.is_empty() {
                    self.orphaned.lock().extend(unsent);
                }
                removed.push(partner.clone());
            }
            keep
        });
        removed
    }

    /// Ask every live partner to stop talking to us.
    pub fn cease_all(&self) {
        for proxy in self.all() {
            if !proxy.is_dead() {
                if let Err(e) = proxy.cease_communications() {
                    debug!(peer = %proxy.partner(), error = %e, "Proxy already gone");
                }
            }
        }
    }
}
