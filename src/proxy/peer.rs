//! One proxy: the communication state towards a single partner mesh base.

use crate::error::{LockFailure, MeshError};
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::lock::{LockReply, LockTransfer, PushOutcome};
use crate::proxy::policy::ProxyPolicy;
use crate::transport::Transport;
use crate::xpriso::logger::{log_message, Direction};
use crate::xpriso::{codec, XprisoMessage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Lifecycle of a proxy. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    AwaitingResponse,
    CeasingCommunications,
    Dead,
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ProxyState::Idle => "idle",
            ProxyState::AwaitingResponse => "awaiting-response",
            ProxyState::CeasingCommunications => "ceasing",
            ProxyState::Dead => "dead",
        };
        f.write_str(text)
    }
}

type Reply = oneshot::Sender<Result<XprisoMessage, MeshError>>;

/// Restores the partner's send order from session and sequence numbers.
#[derive(Debug, Default)]
struct InboundOrder {
    session: u64,
    next_expected: u64,
    buffered: BTreeMap<u64, XprisoMessage>,
    stalled_since: Option<Instant>,
}

impl InboundOrder {
    fn starting(session: u64) -> Self {
        Self {
            session,
            next_expected: 1,
            buffered: BTreeMap::new(),
            stalled_since: None,
        }
    }

    fn drain(&mut self, window: Duration) -> Vec<XprisoMessage> {
        let mut ready = Vec::new();
        loop {
            let before = ready.len();
            while let Some(message) = self.buffered.remove(&self.next_expected) {
                self.next_expected += 1;
                ready.push(message);
            }
            let Some(&first_buffered) = self.buffered.keys().next() else {
                self.stalled_since = None;
                return ready;
            };
            if ready.len() > before || self.stalled_since.is_none() {
                self.stalled_since = Some(Instant::now());
            }
            let stalled = self
                .stalled_since
                .map(|since| since.elapsed() >= window)
                .unwrap_or(false);
            if !stalled {
                return ready;
            }
            warn!(
                session = self.session,
                missing_from = self.next_expected,
                resuming_at = first_buffered,
                "Giving up on lost messages"
            );
            self.next_expected = first_buffered;
            self.stalled_since = None;
        }
    }
}

/// Communication endpoint towards one partner.
///
/// Outbound messages go through an unbounded queue drained by a send task,
/// which stamps session and sequence numbers in queue order. Requests wait on
/// a oneshot channel keyed by request id.
pub struct Proxy {
    local: NetworkIdentifier,
    partner: NetworkIdentifier,
    session: u64,
    policy: ProxyPolicy,
    state: Mutex<ProxyState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<XprisoMessage>>>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, Reply>>,
    lock_transfers: Mutex<HashSet<MeshObjectIdentifier>>,
    withdrawn: Mutex<HashSet<u64>>,
    inbound: Mutex<InboundOrder>,
    last_heard: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    unsent: Mutex<Vec<XprisoMessage>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("local", &self.local)
            .field("partner", &self.partner)
            .field("session", &self.session)
            .field("state", &self.state())
            .finish()
    }
}

impl Proxy {
    /// Create a proxy and start its send task.
    pub(crate) fn spawn(
        local: NetworkIdentifier,
        partner: NetworkIdentifier,
        session: u64,
        policy: ProxyPolicy,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let proxy = Arc::new(Self {
            local,
            partner,
            session,
            policy,
            state: Mutex::new(ProxyState::Idle),
            outbound: Mutex::new(Some(tx)),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            lock_transfers: Mutex::new(HashSet::new()),
            withdrawn: Mutex::new(HashSet::new()),
            inbound: Mutex::new(InboundOrder::default()),
            last_heard: Mutex::new(now),
            last_sent: Mutex::new(now),
            unsent: Mutex::new(Vec::new()),
        });
        tokio::spawn(send_loop(Arc::downgrade(&proxy), transport, rx));
        proxy
    }

    pub fn local(&self) -> &NetworkIdentifier {
        &self.local
    }

    pub fn partner(&self) -> &NetworkIdentifier {
        &self.partner
    }

    /// Session of the messages this proxy sends.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Session of the partner's messages, 0 before the first one arrived.
    pub fn inbound_session(&self) -> u64 {
        self.inbound.lock().session
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    pub fn is_dead(&self) -> bool {
        self.state() == ProxyState::Dead
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn last_heard(&self) -> Instant {
        *self.last_heard.lock()
    }

    /// Whether nothing arrived from the partner for longer than `threshold`.
    pub fn is_silent_for(&self, threshold: Duration) -> bool {
        self.last_heard().elapsed() > threshold
    }

    /// Time since the last message went out.
    pub fn idle_for(&self) -> Duration {
        self.last_sent.lock().elapsed()
    }

    fn heard_since(&self, instant: Instant) -> bool {
        self.last_heard() > instant
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A fresh message addressed to the partner.
    pub fn new_message(&self) -> XprisoMessage {
        let mut message = XprisoMessage::new(self.local.clone(), self.partner.clone());
        message.request_id = self.next_request_id();
        message
    }

    fn refresh_state(&self) {
        let waiting = !self.pending.lock().is_empty();
        let mut state = self.state.lock();
        if matches!(*state, ProxyState::Idle | ProxyState::AwaitingResponse) {
            *state = if waiting {
                ProxyState::AwaitingResponse
            } else {
                ProxyState::Idle
            };
        }
    }

    fn enqueue(&self, message: XprisoMessage) -> Result<(), MeshError> {
        let outbound = self.outbound.lock();
        let sender = outbound
            .as_ref()
            .ok_or_else(|| MeshError::ProxyDead(self.partner.clone()))?;
        sender
            .send(message)
            .map_err(|_| MeshError::ProxyDead(self.partner.clone()))?;
        *self.last_sent.lock() = Instant::now();
        Ok(())
    }

    /// Queue a message without waiting for an answer.
    pub fn send_message(&self, mut message: XprisoMessage) -> Result<(), MeshError> {
        if message.request_id == 0 {
            message.request_id = self.next_request_id();
        }
        self.enqueue(message)
    }

    /// Queue a request now; `wait_for` waits for its response. Lets a caller
    /// keep the send order of requests and plain messages.
    pub fn queue_request(&self, mut message: XprisoMessage) -> Result<QueuedRequest, MeshError> {
        if message.request_id == 0 {
            message.request_id = self.next_request_id();
        }
        message.expects_response = true;
        let request_id = message.request_id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        self.refresh_state();
        if let Err(e) = self.enqueue(message) {
            self.pending.lock().remove(&request_id);
            self.refresh_state();
            return Err(e);
        }
        Ok(QueuedRequest {
            request_id,
            response: rx,
            sent_at: Instant::now(),
        })
    }

    /// Wait for the response to a queued request.
    ///
    /// Times out with `ProxyUnreachable` when the partner stayed silent, or
    /// `Timeout` when it is alive but did not answer. Dropping the returned
    /// future withdraws the request.
    pub async fn wait_for(
        &self,
        queued: QueuedRequest,
        timeout: Duration,
    ) -> Result<XprisoMessage, MeshError> {
        let QueuedRequest {
            request_id,
            response,
            sent_at,
        } = queued;
        let mut guard = PendingGuard {
            proxy: self,
            request_id,
            armed: true,
        };
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => {
                guard.armed = false;
                result
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(MeshError::ProxyDead(self.partner.clone()))
            }
            Err(_) if self.heard_since(sent_at) => Err(MeshError::Timeout(format!(
                "no answer from {} to request {} within {:?}",
                self.partner, request_id, timeout
            ))),
            Err(_) => Err(MeshError::ProxyUnreachable(self.partner.clone())),
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        message: XprisoMessage,
        timeout: Duration,
    ) -> Result<XprisoMessage, MeshError> {
        let queued = self.queue_request(message)?;
        self.wait_for(queued, timeout).await
    }

    /// Hand a response to the request waiting for it. Returns false when
    /// nobody waits any more.
    pub fn complete(&self, response: XprisoMessage) -> bool {
        let Some(request_id) = response.response_id else {
            return false;
        };
        let waiter = self.pending.lock().remove(&request_id);
        self.refresh_state();
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(response));
                true
            }
            None => {
                trace!(peer = %self.partner, request_id, "Response arrived after its request was dropped");
                false
            }
        }
    }

    fn begin_transfer(&self, identifier: &MeshObjectIdentifier) -> Result<TransferGuard<'_>, MeshError> {
        if !self.lock_transfers.lock().insert(identifier.clone()) {
            return Err(MeshError::LockUnavailable {
                identifier: identifier.clone(),
                cause: LockFailure::InFlight,
            });
        }
        Ok(TransferGuard {
            proxy: self,
            identifier: identifier.clone(),
        })
    }

    /// Ask the partner for the lock of `identifier`.
    pub async fn request_lock(
        &self,
        identifier: &MeshObjectIdentifier,
        timeout: Duration,
    ) -> Result<LockReply, MeshError> {
        let _transfer = self.begin_transfer(identifier)?;
        let mut message = self.new_message();
        message.requested_lock_objects.push(identifier.clone());
        let reply = self.request(message, timeout).await?;

        if reply.accepted_lock_objects.contains(identifier) {
            let epoch = reply
                .push_lock_objects
                .iter()
                .find(|t| &t.identifier == identifier)
                .map(|t| t.epoch.clone())
                .ok_or_else(|| {
                    MeshError::Protocol(format!("lock grant for {} without transfer", identifier))
                })?;
            return Ok(LockReply::Granted(epoch));
        }
        let epoch = reply
            .denied_lock_objects
            .iter()
            .find(|r| &r.identifier == identifier)
            .map(|r| r.epoch.clone());
        Ok(LockReply::Denied(epoch))
    }

    /// Hand the lock to the partner and wait for its acknowledgement.
    pub async fn push_lock(
        &self,
        transfer: LockTransfer,
        timeout: Duration,
    ) -> Result<PushOutcome, MeshError> {
        let identifier = transfer.identifier.clone();
        let _transfer = self.begin_transfer(&identifier)?;
        let mut message = self.new_message();
        message.push_lock_objects.push(transfer);
        let reply = self.request(message, timeout).await?;
        if reply.accepted_lock_objects.contains(&identifier) {
            Ok(PushOutcome::Ack)
        } else {
            Ok(PushOutcome::Nack)
        }
    }

    pub fn send_heartbeat(&self) -> Result<(), MeshError> {
        trace!(peer = %self.partner, "Sending heartbeat");
        self.send_message(self.new_message())
    }

    /// Tell the partner this proxy is going away. The proxy dies once the
    /// message has been sent.
    pub fn cease_communications(&self) -> Result<(), MeshError> {
        {
            let mut state = self.state.lock();
            if *state == ProxyState::Dead {
                return Err(MeshError::ProxyDead(self.partner.clone()));
            }
            *state = ProxyState::CeasingCommunications;
        }
        let mut message = self.new_message();
        message.cease_communications = true;
        self.enqueue(message)
    }

    /// Give up on the partner. Every waiting request fails with `ProxyDead`.
    pub fn mark_dead(&self) {
        {
            let mut state = self.state.lock();
            if *state == ProxyState::Dead {
                return;
            }
            *state = ProxyState::Dead;
        }
        self.outbound.lock().take();
        let waiting: Vec<Reply> = self.pending.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiting {
            let _ = waiter.send(Err(MeshError::ProxyDead(self.partner.clone())));
        }
        debug!(local = %self.local, peer = %self.partner, "Proxy is dead");
    }

    /// Messages that were queued but never reached the transport.
    pub fn take_unsent(&self) -> Vec<XprisoMessage> {
        std::mem::take(&mut *self.unsent.lock())
    }

    /// Record requests the partner no longer waits for.
    pub fn withdraw(&self, request_ids: &[u64]) {
        if request_ids.is_empty() {
            return;
        }
        self.withdrawn.lock().extend(request_ids.iter().copied());
    }

    /// Whether the partner withdrew its request `request_id`. Consumes the mark.
    pub fn take_withdrawn(&self, request_id: u64) -> bool {
        self.withdrawn.lock().remove(&request_id)
    }

    /// Accept a message from the partner; returns the messages now deliverable,
    /// in the partner's send order.
    pub fn accept_incoming(&self, message: XprisoMessage) -> Vec<XprisoMessage> {
        *self.last_heard.lock() = Instant::now();
        log_message(Direction::Incoming, &message);

        let mut inbound = self.inbound.lock();
        if message.session > inbound.session {
            if inbound.session != 0 {
                debug!(peer = %self.partner, session = message.session, "Partner started a new session");
            }
            *inbound = InboundOrder::starting(message.session);
        } else if message.session < inbound.session {
            debug!(peer = %self.partner, session = message.session, "Dropping message from an old session");
            return Vec::new();
        }
        if message.sequence < inbound.next_expected
            || inbound.buffered.contains_key(&message.sequence)
        {
            trace!(peer = %self.partner, sequence = message.sequence, "Dropping duplicate message");
            return Vec::new();
        }
        inbound.buffered.insert(message.sequence, message);
        inbound.drain(self.policy.reorder_window)
    }

    /// Release messages held back by a gap that outlived the reorder window.
    pub fn flush_stalled(&self) -> Vec<XprisoMessage> {
        self.inbound.lock().drain(self.policy.reorder_window)
    }

    fn send_withdrawal(&self, request_id: u64) {
        if self.is_dead() {
            return;
        }
        let mut message = self.new_message();
        message.withdrawn_requests.push(request_id);
        if let Err(e) = self.send_message(message) {
            trace!(peer = %self.partner, error = %e, "Could not withdraw request");
        }
    }
}

/// A request on its way to the partner.
#[derive(Debug)]
pub struct QueuedRequest {
    request_id: u64,
    response: oneshot::Receiver<Result<XprisoMessage, MeshError>>,
    sent_at: Instant,
}

impl QueuedRequest {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

/// Removes a pending request when its waiter goes away early.
struct PendingGuard<'a> {
    proxy: &'a Proxy,
    request_id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self.proxy.pending.lock().remove(&self.request_id);
        self.proxy.refresh_state();
        if removed.is_some() {
            self.proxy.send_withdrawal(self.request_id);
        }
    }
}

struct TransferGuard<'a> {
    proxy: &'a Proxy,
    identifier: MeshObjectIdentifier,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.proxy.lock_transfers.lock().remove(&self.identifier);
    }
}

async fn send_loop(
    proxy: Weak<Proxy>,
    transport: Arc<dyn Transport>,
    mut queue: mpsc::UnboundedReceiver<XprisoMessage>,
) {
    let Some((local, partner, session)) = proxy
        .upgrade()
        .map(|p| (p.local.clone(), p.partner.clone(), p.session))
    else {
        return;
    };

    let channel = match transport.open_channel(&local, &partner).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(peer = %partner, error = %e, "Cannot open channel");
            if let Some(proxy) = proxy.upgrade() {
                proxy.mark_dead();
                let mut unsent = proxy.unsent.lock();
                while let Ok(message) = queue.try_recv() {
                    unsent.push(message);
                }
            }
            return;
        }
    };

    let mut sequence = 0u64;
    while let Some(mut message) = queue.recv().await {
        message.session = session;
        message.sequence = sequence + 1;
        let bytes = match codec::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %partner, request_id = message.request_id, error = %e, "Dropping unencodable message");
                continue;
            }
        };
        sequence += 1;
        log_message(Direction::Outgoing, &message);

        let ceasing = message.cease_communications;
        if let Err(e) = channel.send(bytes).await {
            warn!(peer = %partner, error = %e, "Send failed, giving up on proxy");
            if let Some(proxy) = proxy.upgrade() {
                proxy.mark_dead();
                let mut unsent = proxy.unsent.lock();
                unsent.push(message);
                while let Ok(message) = queue.try_recv() {
                    unsent.push(message);
                }
            }
            return;
        }
        if ceasing {
            if let Some(proxy) = proxy.upgrade() {
                proxy.mark_dead();
            }
            return;
        }
    }
}
