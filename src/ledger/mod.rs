//! Bounded, ordered, de-duplicated per-session event history.
//!
//! The ledger is the source of truth for late-subscriber replay and UI
//! refresh. Entries are strictly sequence-ordered per session, fingerprints
//! are unique per session, and trimming only ever removes from the front.
//! Appends run under a per-session lock; the event-bus publish happens
//! inside that same critical section (see [`MessageLedger::append_with`])
//! so a concurrent replay observes either the pre-append snapshot with the
//! live event still to come, or the post-append snapshot with the event
//! already included — never a torn view.

pub mod shard;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;

use crate::config::LedgerConfig;
use crate::events::SessionEvent;
use crate::{AppError, Result};

/// Outcome of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was new and is now stored.
    Inserted,
    /// The fingerprint was already present; nothing changed.
    Duplicate,
}

/// Size report for one session's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSize {
    /// Stored entry count.
    pub count: usize,
    /// Oldest retained sequence number, if any.
    pub oldest_seq: Option<u64>,
    /// Newest retained sequence number, if any.
    pub newest_seq: Option<u64>,
}

struct StoredEntry {
    event: SessionEvent,
    bytes: usize,
    retention_deadline: DateTime<Utc>,
}

#[derive(Default)]
struct SessionLog {
    entries: VecDeque<StoredEntry>,
    fingerprints: HashSet<String>,
    bytes: usize,
}

/// Ordered, bounded, fingerprint-unique event record per session.
pub struct MessageLedger {
    config: LedgerConfig,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionLog>>>>,
    shard_tx: Mutex<Option<mpsc::UnboundedSender<shard::ShardLine>>>,
}

impl MessageLedger {
    /// Create a ledger with the given retention caps.
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            shard_tx: Mutex::new(None),
        }
    }

    /// Attach the shard writer channel; subsequent appends are persisted.
    pub fn attach_shard_writer(&self, tx: mpsc::UnboundedSender<shard::ShardLine>) {
        if let Ok(mut guard) = self.shard_tx.lock() {
            *guard = Some(tx);
        }
    }

    fn session_log(&self, session_id: &str) -> Arc<Mutex<SessionLog>> {
        let mut sessions = lock_unpoisoned(&self.sessions);
        Arc::clone(sessions.entry(session_id.to_owned()).or_default())
    }

    /// Append an event, invoking `publish` under the same critical section
    /// when (and only when) the event is fresh.
    ///
    /// `publish` must be non-blocking; the event bus's enqueue-or-drop
    /// publish satisfies that.
    pub fn append_with<F>(&self, event: SessionEvent, publish: F) -> AppendOutcome
    where
        F: FnOnce(&SessionEvent),
    {
        let log = self.session_log(&event.session_id);
        let mut log = lock_unpoisoned(&log);

        if log.fingerprints.contains(&event.fingerprint) {
            return AppendOutcome::Duplicate;
        }

        let line = serde_json::to_string(&event).unwrap_or_default();
        let bytes = line.len();
        let deadline = event.at + ChronoDuration::minutes(self.config.max_age_minutes);

        log.fingerprints.insert(event.fingerprint.clone());
        log.bytes += bytes;
        log.entries.push_back(StoredEntry {
            event: event.clone(),
            bytes,
            retention_deadline: deadline,
        });
        self.trim_front(&mut log);

        if self.config.persist_shards {
            if let Ok(guard) = self.shard_tx.lock() {
                if let Some(tx) = guard.as_ref() {
                    let _ = tx.send(shard::ShardLine {
                        session_id: event.session_id.clone(),
                        line,
                    });
                }
            }
        }

        publish(&event);
        AppendOutcome::Inserted
    }

    /// Append without publishing (startup restore path).
    pub fn append(&self, event: SessionEvent) -> AppendOutcome {
        self.append_with(event, |_| {})
    }

    /// Ordered snapshot of a session's entries with `seq >= from_seq`.
    #[must_use]
    pub fn snapshot(&self, session_id: &str, from_seq: u64) -> Vec<SessionEvent> {
        let log = self.session_log(session_id);
        let log = lock_unpoisoned(&log);
        log.entries
            .iter()
            .filter(|e| e.event.seq >= from_seq)
            .map(|e| e.event.clone())
            .collect()
    }

    /// Run `f` with a snapshot and the current cursor (newest stored seq),
    /// atomically with respect to concurrent appends on the same session.
    ///
    /// Used by the bus replay splice: any event with a sequence at or below
    /// the returned cursor has already been through its publish step.
    pub fn snapshot_with_cursor<R>(
        &self,
        session_id: &str,
        from_seq: u64,
        f: impl FnOnce(Vec<SessionEvent>, u64) -> R,
    ) -> R {
        let log = self.session_log(session_id);
        let log = lock_unpoisoned(&log);
        let cursor = log.entries.back().map_or(0, |e| e.event.seq);
        let snapshot: Vec<SessionEvent> = log
            .entries
            .iter()
            .filter(|e| e.event.seq >= from_seq)
            .map(|e| e.event.clone())
            .collect();
        f(snapshot, cursor)
    }

    /// Drop all entries for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownSession` if the session has no history.
    pub fn clear(&self, session_id: &str) -> Result<()> {
        let mut sessions = lock_unpoisoned(&self.sessions);
        sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| AppError::UnknownSession(format!("no ledger for '{session_id}'")))
    }

    /// Entry count and sequence bounds for a session.
    #[must_use]
    pub fn size(&self, session_id: &str) -> LedgerSize {
        let log = self.session_log(session_id);
        let log = lock_unpoisoned(&log);
        LedgerSize {
            count: log.entries.len(),
            oldest_seq: log.entries.front().map(|e| e.event.seq),
            newest_seq: log.entries.back().map(|e| e.event.seq),
        }
    }

    /// Session ids with stored history.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        lock_unpoisoned(&self.sessions).keys().cloned().collect()
    }

    fn trim_front(&self, log: &mut SessionLog) {
        let now = Utc::now();
        while let Some(front) = log.entries.front() {
            let over_count = log.entries.len() > self.config.max_entries;
            let over_bytes = log.bytes > self.config.max_bytes;
            let expired = front.retention_deadline < now;
            if !(over_count || over_bytes || expired) {
                break;
            }
            if let Some(removed) = log.entries.pop_front() {
                log.bytes = log.bytes.saturating_sub(removed.bytes);
                log.fingerprints.remove(&removed.event.fingerprint);
            }
        }
    }
}

/// Lock a mutex, recovering from poisoning by taking the inner guard.
///
/// Panics inside a holder would otherwise wedge every later caller; the
/// ledger's invariants are re-checked on each operation, so continuing with
/// the possibly part-updated state is preferable to propagating the poison.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
