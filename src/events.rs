//! Typed agent events and their sequenced envelope.
//!
//! Everything the remote agent emits is decoded into one [`AgentEvent`]
//! variant; downstream code matches on the tag instead of probing dynamic
//! field shapes. Each emitted event is wrapped in a [`SessionEvent`]
//! envelope carrying the session id, a per-session monotonic sequence
//! number, a wall-clock timestamp, and a content-derived fingerprint used
//! to absorb remote retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Permission mode applied to a session's tool use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Prompt for each privileged tool invocation.
    #[default]
    Default,
    /// Plan-only; no edits are applied.
    Plan,
    /// Edits are accepted without prompting.
    AcceptEdits,
    /// All permission prompts are bypassed.
    BypassPermissions,
}

/// Coarse activity status reported by the agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// No turn in flight.
    #[default]
    Idle,
    /// A user turn is being processed.
    Processing,
    /// The agent is reasoning before emitting output.
    Thinking,
    /// The turn completed; the agent is ready for input.
    Ready,
}

/// Lifecycle state of a tool invocation.
///
/// States advance monotonically: `Running` → (`AwaitingPermission` →)?
/// (`Succeeded` | `Failed`). Regressions reported by the remote are dropped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    /// The tool is executing.
    Running,
    /// The tool is blocked on a permission decision.
    AwaitingPermission,
    /// The tool completed successfully.
    Succeeded,
    /// The tool completed with an error.
    Failed,
}

impl ToolCallState {
    /// Ordinal used to enforce monotonic state advance.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::AwaitingPermission => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }
}

/// Event kinds, used for subscription filtering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Streaming assistant reply fragment.
    AssistantText,
    /// Tool invocation lifecycle event.
    ToolCall,
    /// Permission prompt awaiting a decision.
    PermissionPrompt,
    /// Token usage accounting update.
    UsageUpdate,
    /// Agent activity status transition.
    StatusChange,
    /// Error surfaced from the link or the agent.
    Error,
}

/// A decoded agent event. Tagged union; one variant per kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Streaming assistant reply fragment.
    AssistantText {
        /// Fragment text.
        content: String,
        /// Whether this fragment closes the assistant message.
        is_final: bool,
    },
    /// Tool invocation with lifecycle state.
    ToolCall {
        /// Remote-assigned tool invocation id.
        tool_id: String,
        /// Tool name.
        name: String,
        /// Latest known input payload (may have streamed in incrementally).
        input: serde_json::Value,
        /// Current lifecycle state.
        state: ToolCallState,
        /// When the invocation started.
        started_at: DateTime<Utc>,
        /// When the invocation reached a terminal state.
        #[serde(skip_serializing_if = "Option::is_none")]
        finished_at: Option<DateTime<Utc>>,
        /// Result payload for `Succeeded`.
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        /// Error message for `Failed`.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Permission prompt awaiting an out-of-band decision.
    PermissionPrompt {
        /// Remote-assigned prompt id.
        prompt_id: String,
        /// Tool the prompt gates.
        tool_name: String,
        /// Tool input under review.
        input: serde_json::Value,
        /// Mode the agent proposes to continue under.
        proposed_mode: PermissionMode,
    },
    /// Usage accounting snapshot.
    UsageUpdate {
        /// Input tokens consumed.
        input_tokens: u64,
        /// Output tokens produced.
        output_tokens: u64,
        /// Tokens served from prompt cache.
        cache_read_tokens: u64,
        /// Current context window occupancy.
        context_size: u64,
    },
    /// Activity status transition. A `processing → ready` transition marks
    /// the turn boundary.
    StatusChange {
        /// Previous status.
        from: EventStatus,
        /// New status.
        to: EventStatus,
        /// Optional transition reason (e.g. `aborted`).
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Request id echoed from the originating user message's metadata,
        /// when the remote supports the round-trip.
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Error surfaced to subscribers.
    Error {
        /// Stable error kind string.
        kind: String,
        /// Human-readable message.
        message: String,
        /// Whether the daemon will retry on its own.
        retriable: bool,
    },
}

impl AgentEvent {
    /// The kind tag for filtering.
    #[must_use]
    pub const fn event_kind(&self) -> EventKind {
        match self {
            Self::AssistantText { .. } => EventKind::AssistantText,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::PermissionPrompt { .. } => EventKind::PermissionPrompt,
            Self::UsageUpdate { .. } => EventKind::UsageUpdate,
            Self::StatusChange { .. } => EventKind::StatusChange,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// Compute the de-duplication fingerprint for an event.
///
/// The fingerprint is a content hash over the event's discriminating fields,
/// scoped by the turn the event belongs to so that identical content in
/// later turns is not mistaken for a remote retry. Remote replays after a
/// reconnect reproduce both the turn and the content, and therefore the
/// fingerprint.
#[must_use]
pub fn fingerprint(turn: u64, event: &AgentEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(turn.to_be_bytes());

    match event {
        AgentEvent::AssistantText { content, is_final } => {
            hasher.update(b"text");
            hasher.update(content.as_bytes());
            hasher.update([u8::from(*is_final)]);
        }
        AgentEvent::ToolCall { tool_id, state, .. } => {
            hasher.update(b"tool");
            hasher.update(tool_id.as_bytes());
            hasher.update([state.rank(), u8::from(matches!(state, ToolCallState::Failed))]);
        }
        AgentEvent::PermissionPrompt { prompt_id, .. } => {
            hasher.update(b"prompt");
            hasher.update(prompt_id.as_bytes());
        }
        AgentEvent::UsageUpdate {
            input_tokens,
            output_tokens,
            cache_read_tokens,
            context_size,
        } => {
            hasher.update(b"usage");
            for n in [input_tokens, output_tokens, cache_read_tokens, context_size] {
                hasher.update(n.to_be_bytes());
            }
        }
        AgentEvent::StatusChange { from, to, reason, .. } => {
            hasher.update(b"status");
            hasher.update([*from as u8, *to as u8]);
            if let Some(reason) = reason {
                hasher.update(reason.as_bytes());
            }
        }
        AgentEvent::Error { kind, message, .. } => {
            hasher.update(b"error");
            hasher.update(kind.as_bytes());
            hasher.update(message.as_bytes());
        }
    }

    // 128 bits of the digest is plenty for per-session de-duplication.
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], take: usize) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(take * 2);
    for b in bytes.iter().take(take) {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// A sequenced event as delivered to the ledger and every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEvent {
    /// Agent-issued session id the event belongs to.
    pub session_id: String,
    /// Per-session monotonic sequence number, assigned locally at emit time.
    pub seq: u64,
    /// Wall-clock emit timestamp.
    pub at: DateTime<Utc>,
    /// Content-derived de-duplication fingerprint.
    pub fingerprint: String,
    /// The decoded event payload.
    #[serde(flatten)]
    pub event: AgentEvent,
}
