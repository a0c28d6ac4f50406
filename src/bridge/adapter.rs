//! Channel adapter contract.
//!
//! An adapter is the in-process object implementing one external channel's
//! send/reply capabilities. Adapters are registered with the bridge and
//! borrowed, never owned; the bridge requires every call to be idempotent
//! with respect to network retries on the adapter's side.

use serde::{Deserialize, Serialize};

use crate::agent::transport::BoxFuture;
use crate::Result;

/// Inbound payload from an external channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    /// Originating channel id.
    pub channel_id: String,
    /// Routing scope within the channel (e.g. a chat id).
    pub session_key: String,
    /// Channel-assigned message id, unique per channel.
    pub message_id: String,
    /// Sender identity within the channel.
    pub sender_id: String,
    /// Message text.
    pub text: String,
    /// Message this one replies to, when threaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    /// Channel-specific metadata passed through to the agent.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Capability set the bridge requires from a channel.
pub trait ChannelAdapter: Send + Sync {
    /// Stable channel identifier.
    fn channel_id(&self) -> &str;

    /// Send free-standing text to a chat/target.
    fn send_text<'a>(&'a self, to: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Reply-thread text against an earlier inbound message id.
    fn reply_text<'a>(&'a self, reply_to_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Typing indicator for a chat/target. Best-effort.
    fn send_typing<'a>(&'a self, to: &'a str) -> BoxFuture<'a, Result<()>>;
}
