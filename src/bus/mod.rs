//! Event fan-out with per-subscriber bounded queues and drop policies.
//!
//! `publish` never suspends: each matching subscriber either enqueues the
//! event or applies its drop policy and returns. Within one subscription,
//! session events are delivered in strictly increasing sequence order;
//! drops caused by `DropNewest` are reified as [`Delivery::Gap`] markers so
//! downstream can decide to request a replay. Error events bypass usage
//! coalescing and are never dropped-newest — the most recent error always
//! arrives, at worst at the cost of the oldest queued event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::sync::Notify;

use crate::events::{AgentEvent, EventKind, SessionEvent};
use crate::ledger::{AppendOutcome, MessageLedger};

/// An event on the bus: a sequenced session event, or one of the
/// infrastructure notifications surfaced to UIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Sequenced agent event (ledger-backed).
    Session(SessionEvent),
    /// A session connected or disconnected.
    SessionLifecycle {
        /// Stable session name.
        session_name: String,
        /// Agent-issued session id, when known.
        session_id: Option<String>,
        /// Whether the session is now connected.
        connected: bool,
    },
    /// The active workspace changed.
    WorkspaceSwitched {
        /// Session whose workspace moved.
        session_name: String,
        /// New workspace path.
        path: String,
    },
    /// A workspace switch failed; buffered inbounds are being failed.
    SwitchFailed {
        /// Session whose switch failed.
        session_name: String,
        /// Stable error kind.
        kind: String,
        /// Human-readable message.
        message: String,
    },
    /// A secret was written through the settings API.
    SecretChanged {
        /// Secret key that changed.
        key: String,
    },
    /// Ledger shards were restored at startup.
    MessagesRestored {
        /// Session whose history was restored.
        session_id: String,
        /// Restored entry count.
        count: usize,
    },
    /// The agent child process state changed.
    DaemonStatusChanged {
        /// Whether the child is running.
        running: bool,
        /// Child pid when running.
        pid: Option<u32>,
    },
    /// Progress while starting the agent child.
    DaemonStartProgress {
        /// Human-readable phase label.
        phase: String,
        /// Rough completion percentage.
        percent: u8,
    },
    /// The agent child failed fatally; auto-restart is off.
    DaemonFailed {
        /// Stable error kind (`AgentStartFailed`, `CrashLoop`).
        kind: String,
        /// Human-readable message.
        message: String,
    },
    /// Files changed under the active workspace.
    FileChanged {
        /// Affected paths.
        paths: Vec<String>,
    },
    /// The daemon finished its startup sequence.
    Initialized,
}

impl BusEvent {
    fn session_event(&self) -> Option<&SessionEvent> {
        match self {
            Self::Session(ev) => Some(ev),
            _ => None,
        }
    }

    fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionEvent { event: AgentEvent::Error { .. }, .. })
        )
    }

    fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionEvent { event: AgentEvent::UsageUpdate { .. }, .. })
        )
    }
}

/// What a subscriber pulls from its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Sequence gap caused by overflow drops; `from..=to` were lost.
    Gap {
        /// Session the gap belongs to.
        session_id: String,
        /// First dropped sequence number.
        from: u64,
        /// Last dropped sequence number.
        to: u64,
    },
    /// A delivered event.
    Event(BusEvent),
}

/// Per-subscriber overflow policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Silently drop the incoming event (gap-marked for session events).
    DropNewest,
    /// Evict the oldest queued event to make room.
    DropOldest,
    /// Usage updates collapse into a single slot; other overflow evicts
    /// the oldest queued event.
    CoalesceUsage,
}

/// Topic filter for a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Only events for this session id (None = all sessions).
    pub session_id: Option<String>,
    /// Only these event kinds (None = all kinds).
    pub kinds: Option<HashSet<EventKind>>,
    /// Whether infrastructure events are delivered.
    pub include_infra: bool,
}

impl SubscriptionFilter {
    /// Filter that matches every event.
    #[must_use]
    pub fn all() -> Self {
        Self { session_id: None, kinds: None, include_infra: true }
    }

    /// Filter for one session's events (infra included).
    #[must_use]
    pub fn session(session_id: impl Into<String>) -> Self {
        Self { session_id: Some(session_id.into()), kinds: None, include_infra: true }
    }

    /// Restrict to the given kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    fn matches(&self, event: &BusEvent) -> bool {
        match event.session_event() {
            Some(ev) => {
                if let Some(ref want) = self.session_id {
                    if *want != ev.session_id {
                        return false;
                    }
                }
                self.kinds.as_ref().is_none_or(|ks| ks.contains(&ev.event.event_kind()))
            }
            None => self.include_infra,
        }
    }
}

struct QueueInner {
    items: VecDeque<Delivery>,
    /// Per-session floor set by replay: live events below it were already
    /// replayed out of the ledger and must not be delivered twice.
    live_floor: HashMap<String, u64>,
    /// Merged drop-newest gap awaiting delivery, per session.
    pending_gap: HashMap<String, (u64, u64)>,
    closed: bool,
}

struct SubQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: DropPolicy,
}

impl SubQueue {
    fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                live_floor: HashMap::new(),
                pending_gap: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    fn offer(&self, event: BusEvent) {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.closed {
            return;
        }

        if let Some(ev) = event.session_event() {
            if let Some(floor) = inner.live_floor.get(&ev.session_id) {
                if ev.seq < *floor {
                    return;
                }
            }
        }

        // Coalescing applies whether or not the queue is full: a usage
        // update supersedes the one already queued, holding a single slot.
        if self.policy == DropPolicy::CoalesceUsage && event.is_usage() {
            if let Some(ev) = event.session_event() {
                let session = ev.session_id.clone();
                if let Some(slot) = inner.items.iter_mut().find(|d| match d {
                    Delivery::Event(queued) => {
                        queued.is_usage()
                            && queued.session_event().is_some_and(|q| q.session_id == session)
                    }
                    Delivery::Gap { .. } => false,
                }) {
                    *slot = Delivery::Event(event);
                    drop(inner);
                    self.notify.notify_one();
                    return;
                }
            }
        }

        if inner.items.len() >= self.capacity {
            if event.is_error() || matches!(self.policy, DropPolicy::DropOldest | DropPolicy::CoalesceUsage)
            {
                // Errors always land; the oldest queued event pays for it.
                inner.items.pop_front();
            } else {
                // DropNewest: record the hole for a later Gap marker.
                if let Some(ev) = event.session_event() {
                    let entry = inner
                        .pending_gap
                        .entry(ev.session_id.clone())
                        .or_insert((ev.seq, ev.seq));
                    entry.1 = ev.seq;
                }
                return;
            }
        }

        // A pending gap for this session is delivered before the next event
        // that made it through, so the subscriber sees the hole in order.
        if let Some(ev) = event.session_event() {
            if let Some((from, to)) = inner.pending_gap.remove(&ev.session_id) {
                inner.items.push_back(Delivery::Gap {
                    session_id: ev.session_id.clone(),
                    from,
                    to,
                });
            }
        }

        inner.items.push_back(Delivery::Event(event));
        drop(inner);
        self.notify.notify_one();
    }

    fn close(&self) {
        lock_unpoisoned(&self.inner).closed = true;
        // notify_one stores a permit even with no registered waiter, so a
        // receiver racing the close still wakes; notify_waiters covers the
        // already-parked ones.
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

struct SubEntry {
    filter: SubscriptionFilter,
    queue: Arc<SubQueue>,
}

/// Handle to one subscription; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Arc<SubQueue>,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Await the next delivery; `None` once unsubscribed/closed and drained.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut inner = lock_unpoisoned(&self.queue.inner);
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking pull.
    #[must_use]
    pub fn try_recv(&self) -> Option<Delivery> {
        lock_unpoisoned(&self.queue.inner).items.pop_front()
    }

    /// Subscription id (for logs).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Fan-out hub delivering bus events to subscribers.
pub struct EventBus {
    subs: RwLock<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
    ledger: Arc<MessageLedger>,
    default_capacity: usize,
}

impl EventBus {
    /// Create a bus backed by the given ledger.
    #[must_use]
    pub fn new(ledger: Arc<MessageLedger>, default_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ledger,
            default_capacity,
        })
    }

    /// Register a subscription.
    #[must_use]
    pub fn subscribe(
        self: &Arc<Self>,
        filter: SubscriptionFilter,
        capacity: Option<usize>,
        policy: DropPolicy,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubQueue::new(capacity.unwrap_or(self.default_capacity), policy));
        if let Ok(mut subs) = self.subs.write() {
            subs.insert(id, SubEntry { filter, queue: Arc::clone(&queue) });
        }
        Subscription { id, queue, bus: Arc::downgrade(self) }
    }

    /// Remove a subscription; idempotent.
    pub fn unsubscribe(&self, id: u64) {
        let entry = self.subs.write().ok().and_then(|mut subs| subs.remove(&id));
        if let Some(entry) = entry {
            entry.queue.close();
        }
    }

    /// Publish a sequenced session event: ledger append plus fan-out, in
    /// one critical section per session. Duplicates are absorbed here.
    pub fn publish_session(&self, event: SessionEvent) -> AppendOutcome {
        self.ledger.append_with(event, |ev| self.fanout(&BusEvent::Session(ev.clone())))
    }

    /// Publish an infrastructure event (not ledgered).
    pub fn publish_infra(&self, event: BusEvent) {
        self.fanout(&event);
    }

    /// Replay ledger entries from `from_seq` into the subscription, then
    /// splice live delivery so nothing is duplicated or missed.
    ///
    /// Atomicity: the snapshot and the live floor update happen under the
    /// session's ledger lock, so any event sequenced at or below the cursor
    /// has already passed through publish and is either replaced by its
    /// replay copy or was never queued; events above the cursor flow live.
    pub fn replay(&self, sub: &Subscription, session_id: &str, from_seq: u64) {
        self.ledger.snapshot_with_cursor(session_id, from_seq, |snapshot, cursor| {
            let mut inner = lock_unpoisoned(&sub.queue.inner);
            inner.live_floor.insert(session_id.to_owned(), cursor + 1);
            inner.pending_gap.remove(session_id);

            let retained: Vec<Delivery> = inner
                .items
                .drain(..)
                .filter(|d| match d {
                    Delivery::Event(BusEvent::Session(ev)) => {
                        ev.session_id != session_id || ev.seq > cursor
                    }
                    Delivery::Gap { session_id: sid, .. } => sid != session_id,
                    Delivery::Event(_) => true,
                })
                .collect();

            for ev in snapshot {
                inner.items.push_back(Delivery::Event(BusEvent::Session(ev)));
            }
            inner.items.extend(retained);
        });
        sub.queue.notify.notify_one();
    }

    /// Number of live subscriptions (diagnostics).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subs.read().map(|s| s.len()).unwrap_or(0)
    }

    fn fanout(&self, event: &BusEvent) {
        let Ok(subs) = self.subs.read() else {
            return;
        };
        for entry in subs.values() {
            if entry.filter.matches(event) {
                entry.queue.offer(event.clone());
            }
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
