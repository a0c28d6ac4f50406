//! Agent wire frames.
//!
//! Frames travel as single-line JSON objects discriminated by a `type`
//! field. Unknown inbound types are skipped (logged at `DEBUG`) so newer
//! agents can add frames without breaking older daemons.
//!
//! # Known inbound frames
//!
//! | Type         | Maps to                                   |
//! |--------------|-------------------------------------------|
//! | `hello`      | connect/reconnect acknowledgement         |
//! | `text`       | [`AgentEvent::AssistantText`]             |
//! | `tool_input` | tool input accumulation (no event)        |
//! | `tool_state` | [`AgentEvent::ToolCall`]                  |
//! | `permission` | [`AgentEvent::PermissionPrompt`]          |
//! | `usage`      | [`AgentEvent::UsageUpdate`]               |
//! | `status`     | [`AgentEvent::StatusChange`]              |
//! | `error`      | [`AgentEvent::Error`]                     |
//! | `pong`       | liveness acknowledgement (no event)       |
//! | *(other)*    | skipped; logged at `DEBUG`                |

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{EventStatus, PermissionMode, ToolCallState};
use crate::{AppError, Result};

/// Frame types this daemon understands.
const KNOWN_INBOUND_TYPES: &[&str] = &[
    "hello",
    "text",
    "tool_input",
    "tool_state",
    "permission",
    "usage",
    "status",
    "error",
    "pong",
];

/// Inbound frame (agent → daemon).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Connect acknowledgement carrying the agent-issued session id.
    Hello {
        /// Agent-issued session id.
        session_id: String,
        /// Working directory the agent reports, when it does.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_dir: Option<String>,
    },
    /// Streaming assistant text fragment.
    Text {
        /// Turn the fragment belongs to.
        turn: u64,
        /// Fragment content.
        content: String,
        /// Whether the fragment closes the assistant message.
        #[serde(default)]
        is_final: bool,
    },
    /// Partial tool input; replaces the last known input for the tool id.
    ToolInput {
        /// Turn the invocation belongs to.
        turn: u64,
        /// Tool invocation id.
        tool_id: String,
        /// Tool name.
        name: String,
        /// Latest input payload.
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Tool lifecycle transition.
    ToolState {
        /// Turn the invocation belongs to.
        turn: u64,
        /// Tool invocation id.
        tool_id: String,
        /// Tool name (optional on transitions after the first).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// New lifecycle state.
        state: ToolCallState,
        /// Result payload for successful completion.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        /// Error message for failed completion.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Permission prompt.
    Permission {
        /// Turn the prompt belongs to.
        turn: u64,
        /// Prompt id.
        prompt_id: String,
        /// Gated tool name.
        tool_name: String,
        /// Tool input under review.
        #[serde(default)]
        input: serde_json::Value,
        /// Proposed continuation mode.
        #[serde(default)]
        proposed_mode: PermissionMode,
    },
    /// Usage accounting snapshot.
    Usage {
        /// Input tokens consumed.
        input_tokens: u64,
        /// Output tokens produced.
        output_tokens: u64,
        /// Tokens served from prompt cache.
        #[serde(default)]
        cache_read_tokens: u64,
        /// Context window occupancy.
        #[serde(default)]
        context_size: u64,
    },
    /// Activity status transition.
    Status {
        /// Turn the transition belongs to.
        turn: u64,
        /// Previous status.
        from: EventStatus,
        /// New status.
        to: EventStatus,
        /// Request id echoed from user-message metadata, when supported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Error surfaced by the agent or its backend.
    Error {
        /// Stable error kind.
        kind: String,
        /// Human-readable message.
        message: String,
        /// Whether the condition is transient.
        #[serde(default)]
        retriable: bool,
    },
    /// Liveness acknowledgement.
    Pong,
}

/// Outbound frame (daemon → agent).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Connect request; `resume` carries the previous session id on
    /// reconnect so the remote can replay from its checkpoint.
    Hello {
        /// Stable session name.
        session_name: String,
        /// Workspace directory.
        workspace: String,
        /// Permission mode for the session.
        permission_mode: PermissionMode,
        /// Previous session id, on reconnect.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<String>,
    },
    /// User message opening a turn.
    UserMessage {
        /// Locally assigned turn number.
        turn: u64,
        /// Message text.
        text: String,
        /// Caller metadata, echoed back on the turn's status frames.
        metadata: serde_json::Value,
    },
    /// Decision for a pending permission prompt.
    PermissionDecision {
        /// Prompt id being resolved.
        prompt_id: String,
        /// `allow` or `deny`.
        decision: String,
        /// Optional mode change.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<PermissionMode>,
        /// Optional tool allowlist.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_tools: Option<Vec<String>>,
    },
    /// Cancel the named turn (or the current one).
    Abort {
        /// Turn to cancel; `None` means the latest.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn: Option<u64>,
    },
    /// Liveness probe.
    Ping,
    /// Orderly goodbye before closing the stream.
    Bye,
}

/// Parse a single JSON line into an [`InboundFrame`].
///
/// # Return value
///
/// - `Ok(Some(frame))` — recognized frame.
/// - `Ok(None)` — blank line or unknown `type` (skipped).
/// - `Err(AppError::Serde)` — malformed JSON or a known type with missing
///   required fields.
///
/// # Errors
///
/// See return value.
pub fn parse_inbound_line(line: &str) -> Result<Option<InboundFrame>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|err| AppError::Serde(format!("malformed frame: {err}")))?;

    let Some(frame_type) = value.get("type").and_then(serde_json::Value::as_str).map(str::to_owned)
    else {
        return Err(AppError::Serde("frame missing `type` field".into()));
    };

    if !KNOWN_INBOUND_TYPES.contains(&frame_type.as_str()) {
        debug!(frame_type, "skipping unknown inbound frame type");
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|err| AppError::Serde(format!("invalid `{frame_type}` frame: {err}")))
}

/// Serialise an outbound frame to its single-line JSON form.
///
/// # Errors
///
/// Returns `AppError::Serde` if serialisation fails (should not occur for
/// these shapes).
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String> {
    serde_json::to_string(frame).map_err(|err| AppError::Serde(err.to_string()))
}
