//! Channel bridge: the only component external channels ever talk to.
//!
//! Decouples channel adapters from the agent. Inbound messages pass the
//! per-channel policy hook, are correlated through a [`PendingRequest`]
//! table, and ride the current session as user turns; assistant replies
//! come back off the event bus, are matched by request-id echo (or the
//! documented FIFO fallback), and leave through a per-channel worker that
//! releases replies in inbound-acceptance order regardless of internal
//! completion order.

pub mod adapter;
pub mod messages;
pub mod policy;
pub mod scrollback;
pub mod simulator;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::adapter::{ChannelAdapter, ChannelMessage};
use crate::bridge::messages::{localize, NoticeKey};
use crate::bridge::policy::{ChannelPolicy, PolicyVerdict};
use crate::bridge::scrollback::{format_context, Scrollback};
use crate::bus::{BusEvent, Delivery, DropPolicy, EventBus, SubscriptionFilter};
use crate::config::GlobalConfig;
use crate::events::{AgentEvent, EventKind, EventStatus};
use crate::router::SessionRouter;
use crate::{AppError, Result};

/// Timed-out request ids remembered for late-reply logging.
const TIMED_OUT_MEMORY: usize = 1024;

// ── Switch gate ──────────────────────────────────────────────────────────────

/// Gate raised by the router for the duration of a workspace switch.
///
/// While raised, accepted inbounds buffer here (up to the cap) instead of
/// being routed; the bridge drains the buffer when the switch outcome
/// lands on the bus.
pub struct SwitchGate {
    switching: AtomicBool,
    buffer: Mutex<VecDeque<ChannelMessage>>,
    cap: usize,
}

impl SwitchGate {
    /// Create a gate with the given buffer cap.
    #[must_use]
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            switching: AtomicBool::new(false),
            buffer: Mutex::new(VecDeque::new()),
            cap,
        })
    }

    /// Raise the gate.
    pub fn begin(&self) {
        self.switching.store(true, Ordering::SeqCst);
    }

    /// Lower the gate. Buffered messages stay until drained.
    pub fn end(&self) {
        self.switching.store(false, Ordering::SeqCst);
    }

    /// Whether a switch is in progress.
    #[must_use]
    pub fn is_switching(&self) -> bool {
        self.switching.load(Ordering::SeqCst)
    }

    fn try_buffer(&self, message: ChannelMessage) -> Result<()> {
        let Ok(mut buffer) = self.buffer.lock() else {
            return Err(AppError::SwitchInProgress("switch buffer unavailable".into()));
        };
        if buffer.len() >= self.cap {
            return Err(AppError::SwitchInProgress(format!(
                "switch buffer full ({} messages)",
                self.cap
            )));
        }
        buffer.push_back(message);
        Ok(())
    }

    fn drain(&self) -> Vec<ChannelMessage> {
        self.buffer.lock().map(|mut b| b.drain(..).collect()).unwrap_or_default()
    }
}

// ── Correlation records ──────────────────────────────────────────────────────

/// Outcome of [`ChannelBridge::handle_inbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Routed to the agent; the reply will be correlated by request id.
    Accepted {
        /// Correlation id for the eventual reply.
        request_id: String,
    },
    /// Held back by decorative policy; archived in the chat scrollback.
    Archived,
    /// Buffered while a workspace switch completes.
    Buffered,
}

struct PendingRequest {
    request_id: String,
    channel_id: String,
    /// Originating message id; replies thread against it.
    channel_message_id: String,
    /// Chat target for free-standing notices.
    notify_to: String,
    /// Agent session the request rides. Empty while the reservation is
    /// waiting for the session to resolve.
    session_id: String,
    accept_seq: u64,
    submitted_at: DateTime<Utc>,
}

#[derive(Default)]
struct PendingTable {
    by_request: HashMap<String, PendingRequest>,
    /// Acceptance order per session id, for the FIFO fallback.
    fifo: HashMap<String, VecDeque<String>>,
    /// Accumulated assistant text per session while requests are pending.
    buffers: HashMap<String, String>,
    timed_out: HashSet<String>,
    timed_out_order: VecDeque<String>,
}

impl PendingTable {
    fn remove(&mut self, request_id: &str) -> Option<PendingRequest> {
        let pending = self.by_request.remove(request_id)?;
        if let Some(queue) = self.fifo.get_mut(&pending.session_id) {
            queue.retain(|rid| rid != request_id);
            if queue.is_empty() {
                self.fifo.remove(&pending.session_id);
            }
        }
        Some(pending)
    }

    fn mark_timed_out(&mut self, request_id: &str) {
        self.timed_out.insert(request_id.to_owned());
        self.timed_out_order.push_back(request_id.to_owned());
        while self.timed_out_order.len() > TIMED_OUT_MEMORY {
            if let Some(evicted) = self.timed_out_order.pop_front() {
                self.timed_out.remove(&evicted);
            }
        }
    }
}

// ── Outbound serialization ───────────────────────────────────────────────────

enum OutboundAction {
    Reply { reply_to: String, text: String },
    Notice { to: String, text: String },
    /// Occupies the acceptance slot without an adapter call. Submitted for
    /// reservations that die before anything is owed to the channel, so
    /// the in-order release never stalls on a missing sequence number.
    Skip,
}

struct OutboundJob {
    accept_seq: u64,
    action: OutboundAction,
}

struct ChannelEntry {
    adapter: Arc<dyn ChannelAdapter>,
    policy: Arc<dyn ChannelPolicy>,
    locale: String,
    accept_counter: Arc<AtomicU64>,
    outbound_tx: mpsc::UnboundedSender<OutboundJob>,
    worker: JoinHandle<()>,
}

/// Per-channel worker: releases outbound actions strictly in acceptance
/// order, one adapter call at a time.
async fn run_channel_worker(
    channel_id: String,
    adapter: Arc<dyn ChannelAdapter>,
    mut rx: mpsc::UnboundedReceiver<OutboundJob>,
) {
    let mut next: u64 = 1;
    let mut ready: BTreeMap<u64, OutboundAction> = BTreeMap::new();

    while let Some(job) = rx.recv().await {
        ready.insert(job.accept_seq, job.action);
        while let Some(action) = ready.remove(&next) {
            let result = match &action {
                OutboundAction::Reply { reply_to, text } => {
                    adapter.reply_text(reply_to, text).await
                }
                OutboundAction::Notice { to, text } => adapter.send_text(to, text).await,
                OutboundAction::Skip => Ok(()),
            };
            if let Err(err) = result {
                warn!(%channel_id, accept_seq = next, %err, "outbound dispatch failed");
            }
            next += 1;
        }
    }
    debug!(%channel_id, "channel worker stopped");
}

// ── The bridge ───────────────────────────────────────────────────────────────

/// Adapter registry plus inbound/outbound correlation.
pub struct ChannelBridge {
    config: Arc<GlobalConfig>,
    router: Arc<SessionRouter>,
    bus: Arc<EventBus>,
    gate: Arc<SwitchGate>,
    channels: RwLock<HashMap<String, ChannelEntry>>,
    pending: Mutex<PendingTable>,
    scrollback: Scrollback,
    fifo_fallback_total: AtomicU64,
}

impl ChannelBridge {
    /// Create a bridge sharing the router's switch gate.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        router: Arc<SessionRouter>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let gate = router.gate();
        let scrollback = Scrollback::new(config.bridge.scrollback_cap);
        Arc::new(Self {
            config,
            router,
            bus,
            gate,
            channels: RwLock::new(HashMap::new()),
            pending: Mutex::new(PendingTable::default()),
            scrollback,
            fifo_fallback_total: AtomicU64::new(0),
        })
    }

    /// Spawn the event loop consuming assistant output off the bus.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        let sub = self.bus.subscribe(
            SubscriptionFilter {
                session_id: None,
                kinds: Some(
                    [EventKind::AssistantText, EventKind::StatusChange, EventKind::Error]
                        .into_iter()
                        .collect(),
                ),
                include_infra: true,
            },
            None,
            DropPolicy::DropOldest,
        );

        tokio::spawn(async move {
            while let Some(delivery) = sub.recv().await {
                let Delivery::Event(event) = delivery else {
                    continue;
                };
                bridge.on_bus_event(event).await;
            }
            debug!("bridge event loop stopped");
        })
    }

    /// Register an adapter under its channel id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConnected` if the channel id is taken.
    pub fn register_channel(
        &self,
        adapter: Arc<dyn ChannelAdapter>,
        policy: Arc<dyn ChannelPolicy>,
    ) -> Result<()> {
        let channel_id = adapter.channel_id().to_owned();
        let Ok(mut channels) = self.channels.write() else {
            return Err(AppError::Io("adapter registry unavailable".into()));
        };
        if channels.contains_key(&channel_id) {
            return Err(AppError::AlreadyConnected(format!(
                "channel '{channel_id}' already registered"
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let worker =
            tokio::spawn(run_channel_worker(channel_id.clone(), Arc::clone(&adapter), outbound_rx));
        let locale = self
            .config
            .channel_locales
            .get(&channel_id)
            .cloned()
            .unwrap_or_else(|| "en".to_owned());

        channels.insert(
            channel_id.clone(),
            ChannelEntry {
                adapter,
                policy,
                locale,
                accept_counter: Arc::new(AtomicU64::new(0)),
                outbound_tx,
                worker,
            },
        );
        info!(%channel_id, "channel registered");
        Ok(())
    }

    /// Remove an adapter registration; its pending requests are dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownChannel` if nothing is registered.
    pub fn unregister_channel(&self, channel_id: &str) -> Result<()> {
        let entry = {
            let Ok(mut channels) = self.channels.write() else {
                return Err(AppError::Io("adapter registry unavailable".into()));
            };
            channels
                .remove(channel_id)
                .ok_or_else(|| AppError::UnknownChannel(format!("no channel '{channel_id}'")))?
        };
        entry.worker.abort();

        if let Ok(mut table) = self.pending.lock() {
            let orphaned: Vec<String> = table
                .by_request
                .values()
                .filter(|p| p.channel_id == channel_id)
                .map(|p| p.request_id.clone())
                .collect();
            for rid in orphaned {
                table.remove(&rid);
            }
        }
        info!(channel_id, "channel unregistered");
        Ok(())
    }

    /// Entry point for channel adapters: route one inbound user message.
    ///
    /// # Errors
    ///
    /// - `AppError::UnknownChannel` — no adapter under the message's id.
    /// - `AppError::PolicyRejected` — hostile policy rejection.
    /// - `AppError::Throttled` — too many requests in flight.
    /// - `AppError::SwitchInProgress` — switch buffer full.
    /// - `AppError::UnknownSession` — no session could be connected
    ///   (surfaced with the connect failure's message).
    pub async fn handle_inbound(self: &Arc<Self>, message: ChannelMessage) -> Result<InboundOutcome> {
        let (adapter, policy, accept_counter, max_pending) = {
            let Ok(channels) = self.channels.read() else {
                return Err(AppError::Io("adapter registry unavailable".into()));
            };
            let entry = channels.get(&message.channel_id).ok_or_else(|| {
                AppError::UnknownChannel(format!("no channel '{}'", message.channel_id))
            })?;
            (
                Arc::clone(&entry.adapter),
                Arc::clone(&entry.policy),
                Arc::clone(&entry.accept_counter),
                self.config.bridge.max_pending_per_channel,
            )
        };

        match policy.evaluate(&message) {
            PolicyVerdict::Forward => {}
            PolicyVerdict::Archive { reason } => {
                debug!(channel_id = %message.channel_id, %reason, "archiving inbound");
                self.scrollback.push(&message);
                return Ok(InboundOutcome::Archived);
            }
            PolicyVerdict::Deny { reason } => {
                return Err(AppError::PolicyRejected(reason));
            }
        }

        if self.gate.is_switching() {
            self.gate.try_buffer(message)?;
            return Ok(InboundOutcome::Buffered);
        }

        // Throttle check and slot reservation share one critical section;
        // concurrent inbounds near the cap cannot all pass a stale count.
        // The reservation's session id is filled in once the session
        // resolves below.
        let request_id = Uuid::new_v4().to_string();
        let accept_seq = {
            let Ok(mut table) = self.pending.lock() else {
                return Err(AppError::Io("pending table unavailable".into()));
            };
            let in_flight = table
                .by_request
                .values()
                .filter(|p| p.channel_id == message.channel_id)
                .count();
            if in_flight >= max_pending {
                return Err(AppError::Throttled(format!(
                    "channel '{}' has {in_flight} requests in flight",
                    message.channel_id
                )));
            }
            let accept_seq = accept_counter.fetch_add(1, Ordering::SeqCst) + 1;
            table.by_request.insert(
                request_id.clone(),
                PendingRequest {
                    request_id: request_id.clone(),
                    channel_id: message.channel_id.clone(),
                    channel_message_id: message.message_id.clone(),
                    notify_to: message.session_key.clone(),
                    session_id: String::new(),
                    accept_seq,
                    submitted_at: Utc::now(),
                },
            );
            accept_seq
        };

        let session = match self.router.ensure_current().await {
            Ok(session) => session,
            Err(err) => {
                self.drop_reservation(&message.channel_id, &request_id, accept_seq);
                return Err(AppError::UnknownSession(format!("session unavailable: {err}")));
            }
        };

        {
            let Ok(mut table) = self.pending.lock() else {
                return Err(AppError::Io("pending table unavailable".into()));
            };
            if let Some(pending) = table.by_request.get_mut(&request_id) {
                pending.session_id = session.session_id().to_owned();
            }
            table
                .fifo
                .entry(session.session_id().to_owned())
                .or_default()
                .push_back(request_id.clone());
        }

        // Unforwarded chat context rides in front of the actual message.
        let context = self.scrollback.drain(&message);
        let text = if context.is_empty() {
            message.text.clone()
        } else {
            format!("{}\n{}", format_context(&context), message.text)
        };

        let typing_adapter = Arc::clone(&adapter);
        let typing_to = message.session_key.clone();
        tokio::spawn(async move {
            if let Err(err) = typing_adapter.send_typing(&typing_to).await {
                debug!(%err, "typing indicator failed");
            }
        });

        let metadata = json!({
            "request_id": request_id,
            "channel_id": message.channel_id,
            "channel_message_id": message.message_id,
            "sender_id": message.sender_id,
            "channel_metadata": message.metadata,
        });
        if let Err(err) = session.send_user_message(text, metadata).await {
            self.drop_reservation(&message.channel_id, &request_id, accept_seq);
            return Err(AppError::UnknownSession(format!("send failed: {err}")));
        }

        let bridge = Arc::clone(self);
        let timeout_rid = request_id.clone();
        let turn_timeout = self.config.turn_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(turn_timeout).await;
            bridge.on_turn_timeout(&timeout_rid);
        });

        info!(
            %request_id,
            channel_id = %message.channel_id,
            accept_seq,
            "inbound accepted"
        );
        Ok(InboundOutcome::Accepted { request_id })
    }

    /// Resolve the pending request owning a completed turn and dispatch
    /// the accumulated assistant text to its channel.
    ///
    /// `request_id_echo` is the metadata round-trip when the remote
    /// supports it; without it the oldest pending request for the session
    /// inside the turn-timeout window is selected (documented fallback,
    /// counted and logged).
    pub fn deliver_outbound(
        &self,
        session_id: &str,
        request_id_echo: Option<&str>,
        reason: Option<&str>,
    ) {
        let (pending, text) = {
            let Ok(mut guard) = self.pending.lock() else {
                return;
            };
            let table = &mut *guard;
            let chosen = match request_id_echo {
                Some(echo) if table.by_request.contains_key(echo) => Some(echo.to_owned()),
                other => {
                    if let Some(echo) = other {
                        if table.timed_out.contains(echo) {
                            info!(request_id = echo, "late reply for timed-out request, dropping");
                            table.buffers.remove(session_id);
                            return;
                        }
                    }
                    self.fifo_pick(table, session_id)
                }
            };
            let text = table.buffers.remove(session_id).unwrap_or_default();
            (chosen.and_then(|rid| table.remove(&rid)), text)
        };

        let Some(pending) = pending else {
            if !text.is_empty() {
                debug!(session_id, "completed turn had no pending request; reply kept in ledger only");
            }
            return;
        };

        let locale = self.locale_of(&pending.channel_id);
        let aborted = reason == Some("aborted");
        let action = if aborted && (!self.config.bridge.deliver_partial_on_abort || text.is_empty())
        {
            OutboundAction::Notice {
                to: pending.notify_to.clone(),
                text: localize(&locale, NoticeKey::Aborted).to_owned(),
            }
        } else {
            OutboundAction::Reply { reply_to: pending.channel_message_id.clone(), text }
        };
        self.submit(&pending, action);
    }

    /// Total FIFO-fallback correlations since start (observability for the
    /// metadata-echo gap).
    #[must_use]
    pub fn fifo_fallbacks(&self) -> u64 {
        self.fifo_fallback_total.load(Ordering::Relaxed)
    }

    fn fifo_pick(&self, table: &mut PendingTable, session_id: &str) -> Option<String> {
        let window_start = Utc::now()
            - chrono::Duration::seconds(
                i64::try_from(self.config.bridge.turn_timeout_seconds).unwrap_or(i64::MAX),
            );
        let queue = table.fifo.get_mut(session_id)?;
        while let Some(front) = queue.front().cloned() {
            let Some(pending) = table.by_request.get(&front) else {
                queue.pop_front();
                continue;
            };
            if pending.submitted_at < window_start {
                // Should have timed out already; skip rather than misroute.
                queue.pop_front();
                continue;
            }
            self.fifo_fallback_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %front,
                session_id,
                "no request-id echo on turn boundary; using FIFO fallback"
            );
            return Some(front);
        }
        None
    }

    fn on_turn_timeout(&self, request_id: &str) {
        let pending = {
            let Ok(mut table) = self.pending.lock() else {
                return;
            };
            let Some(pending) = table.remove(request_id) else {
                return;
            };
            table.mark_timed_out(request_id);
            pending
        };
        warn!(request_id, channel_id = %pending.channel_id, "turn timed out");
        let locale = self.locale_of(&pending.channel_id);
        let action = OutboundAction::Notice {
            to: pending.notify_to.clone(),
            text: localize(&locale, NoticeKey::TurnTimeout).to_owned(),
        };
        self.submit(&pending, action);
    }

    fn fail_session_pendings(&self, session_id: &str, key: NoticeKey) {
        let failed: Vec<PendingRequest> = {
            let Ok(mut table) = self.pending.lock() else {
                return;
            };
            table.buffers.remove(session_id);
            let rids: Vec<String> = table
                .by_request
                .values()
                .filter(|p| p.session_id == session_id)
                .map(|p| p.request_id.clone())
                .collect();
            rids.into_iter().filter_map(|rid| table.remove(&rid)).collect()
        };
        for pending in failed {
            warn!(request_id = %pending.request_id, session_id, "failing pending request");
            let locale = self.locale_of(&pending.channel_id);
            let action = OutboundAction::Notice {
                to: pending.notify_to.clone(),
                text: localize(&locale, key).to_owned(),
            };
            self.submit(&pending, action);
        }
    }

    fn submit(&self, pending: &PendingRequest, action: OutboundAction) {
        self.submit_seq(&pending.channel_id, pending.accept_seq, action);
    }

    fn submit_seq(&self, channel_id: &str, accept_seq: u64, action: OutboundAction) {
        let Ok(channels) = self.channels.read() else {
            return;
        };
        let Some(entry) = channels.get(channel_id) else {
            debug!(channel_id, "channel gone; dropping outbound");
            return;
        };
        let _ = entry.outbound_tx.send(OutboundJob { accept_seq, action });
    }

    /// Remove a reservation that will owe the channel nothing, releasing
    /// its acceptance slot with a skip marker.
    fn drop_reservation(&self, channel_id: &str, request_id: &str, accept_seq: u64) {
        if let Ok(mut table) = self.pending.lock() {
            table.remove(request_id);
        }
        self.submit_seq(channel_id, accept_seq, OutboundAction::Skip);
    }

    fn locale_of(&self, channel_id: &str) -> String {
        self.config
            .channel_locales
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| "en".to_owned())
    }

    async fn on_bus_event(self: &Arc<Self>, event: BusEvent) {
        match event {
            BusEvent::Session(ev) => match ev.event {
                AgentEvent::AssistantText { content, .. } => {
                    if let Ok(mut table) = self.pending.lock() {
                        if table.fifo.get(&ev.session_id).is_some_and(|q| !q.is_empty()) {
                            table.buffers.entry(ev.session_id.clone()).or_default().push_str(&content);
                        }
                    }
                }
                AgentEvent::StatusChange { to: EventStatus::Ready, reason, request_id, .. } => {
                    self.deliver_outbound(&ev.session_id, request_id.as_deref(), reason.as_deref());
                }
                AgentEvent::Error { retriable: false, .. } => {
                    self.fail_session_pendings(&ev.session_id, NoticeKey::LinkLost);
                }
                _ => {}
            },
            BusEvent::SessionLifecycle { session_id: Some(sid), connected: false, .. } => {
                self.fail_session_pendings(&sid, NoticeKey::LinkLost);
            }
            BusEvent::WorkspaceSwitched { .. } => {
                for message in self.gate.drain() {
                    let notify = (message.channel_id.clone(), message.session_key.clone());
                    if let Err(err) = self.handle_inbound(message).await {
                        warn!(%err, "buffered inbound failed after switch");
                        self.notify_unrouted(&notify.0, &notify.1);
                    }
                }
            }
            BusEvent::SwitchFailed { .. } => {
                for message in self.gate.drain() {
                    self.notify_unrouted(&message.channel_id, &message.session_key);
                }
            }
            _ => {}
        }
    }

    fn notify_unrouted(&self, channel_id: &str, to: &str) {
        let Ok(channels) = self.channels.read() else {
            return;
        };
        let Some(entry) = channels.get(channel_id) else {
            return;
        };
        let adapter = Arc::clone(&entry.adapter);
        let locale = entry.locale.clone();
        let to = to.to_owned();
        tokio::spawn(async move {
            let text = localize(&locale, NoticeKey::SwitchFailed);
            if let Err(err) = adapter.send_text(&to, text).await {
                debug!(%err, "switch-failure notice failed");
            }
        });
    }
}
