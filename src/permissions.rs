//! Pending permission prompts and their out-of-band resolution.
//!
//! Prompts emitted by the agent stay open here so a decision from any
//! surface (HTTP, a chat channel, the extension) can resolve them. Each
//! prompt resolves at most once: the broker holds the resolver handle and
//! consumes it on the first decision; later attempts fail with
//! `AlreadyResolved`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::events::PermissionMode;
use crate::{AppError, Result};

/// How many resolved prompt ids are remembered to distinguish
/// `AlreadyResolved` from `UnknownPrompt`.
const RESOLVED_MEMORY: usize = 1024;

/// Operator decision on a prompt.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptDecision {
    /// Allow the gated tool invocation.
    Allow,
    /// Deny the gated tool invocation.
    Deny,
}

/// Full resolution forwarded to the owning session.
#[derive(Debug, Clone)]
pub struct PromptResolution {
    /// Allow or deny.
    pub decision: PromptDecision,
    /// Optional permission-mode change to continue under.
    pub mode: Option<PermissionMode>,
    /// Optional tool allowlist accompanying an allow.
    pub allowed_tools: Option<Vec<String>>,
    /// Reason recorded for automatic denials (`timeout`, `session-gone`).
    pub reason: Option<String>,
}

/// Resolver handle invoked exactly once with the decision.
pub type PromptResolver = Box<dyn FnOnce(PromptResolution) + Send>;

/// A registered prompt awaiting decision.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PromptRecord {
    /// Session the prompt belongs to.
    pub session_id: String,
    /// Remote-assigned prompt id.
    pub prompt_id: String,
    /// Tool the prompt gates.
    pub tool_name: String,
    /// Tool input under review.
    pub input: serde_json::Value,
    /// Mode the agent proposes.
    pub proposed_mode: PermissionMode,
    /// Registration timestamp.
    pub registered_at: DateTime<Utc>,
}

struct PendingPrompt {
    record: PromptRecord,
    resolver: PromptResolver,
}

#[derive(Default)]
struct BrokerInner {
    pending: HashMap<String, PendingPrompt>,
    by_session: HashMap<String, HashSet<String>>,
    resolved: HashSet<String>,
    resolved_order: VecDeque<String>,
}

/// Broker holding open permission prompts indexed by prompt id, with a
/// per-session partition for bulk denial on disconnect.
#[derive(Default)]
pub struct PermissionBroker {
    inner: Mutex<BrokerInner>,
}

impl PermissionBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prompt with its resolver handle.
    ///
    /// Re-registration of a live or already-resolved prompt id is ignored —
    /// the remote re-sends prompts on reconnect replay.
    pub fn register(&self, record: PromptRecord, resolver: PromptResolver) {
        let mut inner = lock_unpoisoned(&self.inner);
        let id = record.prompt_id.clone();
        if inner.pending.contains_key(&id) || inner.resolved.contains(&id) {
            debug!(prompt_id = %id, "ignoring re-registered permission prompt");
            return;
        }
        inner
            .by_session
            .entry(record.session_id.clone())
            .or_default()
            .insert(id.clone());
        info!(prompt_id = %id, session_id = %record.session_id, tool = %record.tool_name,
            "permission prompt registered");
        inner.pending.insert(id, PendingPrompt { record, resolver });
    }

    /// Resolve a prompt with the given decision.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyResolved` if the prompt was resolved
    /// before, `AppError::UnknownPrompt` if it was never registered.
    pub fn resolve(
        &self,
        prompt_id: &str,
        decision: PromptDecision,
        mode: Option<PermissionMode>,
        allowed_tools: Option<Vec<String>>,
    ) -> Result<()> {
        self.resolve_inner(
            prompt_id,
            PromptResolution { decision, mode, allowed_tools, reason: None },
        )
    }

    /// List pending prompts, optionally scoped to one session.
    #[must_use]
    pub fn list(&self, session_id: Option<&str>) -> Vec<PromptRecord> {
        let inner = lock_unpoisoned(&self.inner);
        let mut records: Vec<PromptRecord> = inner
            .pending
            .values()
            .filter(|p| session_id.is_none_or(|sid| p.record.session_id == sid))
            .map(|p| p.record.clone())
            .collect();
        records.sort_by_key(|r| r.registered_at);
        records
    }

    /// Expire prompts registered before `deadline`: each transitions to
    /// timed-out (denied with reason `timeout`). Returns the expired count.
    pub fn expire_older_than(&self, deadline: DateTime<Utc>) -> usize {
        let expired: Vec<String> = {
            let inner = lock_unpoisoned(&self.inner);
            inner
                .pending
                .values()
                .filter(|p| p.record.registered_at < deadline)
                .map(|p| p.record.prompt_id.clone())
                .collect()
        };
        for id in &expired {
            let _ = self.resolve_inner(
                id,
                PromptResolution {
                    decision: PromptDecision::Deny,
                    mode: None,
                    allowed_tools: None,
                    reason: Some("timeout".into()),
                },
            );
        }
        expired.len()
    }

    /// Deny every pending prompt of a session with reason `session-gone`.
    pub fn deny_session(&self, session_id: &str) {
        let ids: Vec<String> = {
            let inner = lock_unpoisoned(&self.inner);
            inner
                .by_session
                .get(session_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        for id in ids {
            let _ = self.resolve_inner(
                &id,
                PromptResolution {
                    decision: PromptDecision::Deny,
                    mode: None,
                    allowed_tools: None,
                    reason: Some("session-gone".into()),
                },
            );
        }
    }

    fn resolve_inner(&self, prompt_id: &str, resolution: PromptResolution) -> Result<()> {
        let pending = {
            let mut inner = lock_unpoisoned(&self.inner);
            let Some(pending) = inner.pending.remove(prompt_id) else {
                if inner.resolved.contains(prompt_id) {
                    return Err(AppError::AlreadyResolved(format!(
                        "prompt '{prompt_id}' was already resolved"
                    )));
                }
                return Err(AppError::UnknownPrompt(format!("no pending prompt '{prompt_id}'")));
            };

            if let Some(set) = inner.by_session.get_mut(&pending.record.session_id) {
                set.remove(prompt_id);
                if set.is_empty() {
                    inner.by_session.remove(&pending.record.session_id);
                }
            }

            inner.resolved.insert(prompt_id.to_owned());
            inner.resolved_order.push_back(prompt_id.to_owned());
            while inner.resolved_order.len() > RESOLVED_MEMORY {
                if let Some(evicted) = inner.resolved_order.pop_front() {
                    inner.resolved.remove(&evicted);
                }
            }
            pending
        };

        info!(prompt_id, session_id = %pending.record.session_id,
            decision = ?resolution.decision, reason = ?resolution.reason,
            "permission prompt resolved");
        (pending.resolver)(resolution);
        Ok(())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
