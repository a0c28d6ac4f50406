//! Rolling per-chat scrollback of unforwarded inbounds.
//!
//! Messages held back by decorative policy rejections are retained here,
//! bounded per chat, and drained into the next forwarded turn as context.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::bridge::adapter::ChannelMessage;

/// One archived inbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedInbound {
    /// Sender identity within the channel.
    pub sender_id: String,
    /// Message text.
    pub text: String,
    /// Archive timestamp.
    pub at: DateTime<Utc>,
}

/// Bounded per-chat archive.
pub struct Scrollback {
    cap: usize,
    chats: Mutex<HashMap<String, VecDeque<ArchivedInbound>>>,
}

impl Scrollback {
    /// Create a scrollback retaining up to `cap` entries per chat.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self { cap, chats: Mutex::new(HashMap::new()) }
    }

    /// Archive one inbound under its chat key.
    pub fn push(&self, message: &ChannelMessage) {
        let Ok(mut chats) = self.chats.lock() else {
            return;
        };
        let chat = chats.entry(chat_key(message)).or_default();
        chat.push_back(ArchivedInbound {
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            at: Utc::now(),
        });
        while chat.len() > self.cap {
            chat.pop_front();
        }
    }

    /// Take everything archived for the message's chat, oldest first.
    #[must_use]
    pub fn drain(&self, message: &ChannelMessage) -> Vec<ArchivedInbound> {
        self.chats
            .lock()
            .ok()
            .and_then(|mut chats| chats.remove(&chat_key(message)))
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Current entry count for a chat (diagnostics).
    #[must_use]
    pub fn len(&self, channel_id: &str, session_key: &str) -> usize {
        self.chats
            .lock()
            .ok()
            .and_then(|chats| chats.get(&format!("{channel_id}:{session_key}")).map(VecDeque::len))
            .unwrap_or(0)
    }

    /// Whether a chat has no archived entries.
    #[must_use]
    pub fn is_empty(&self, channel_id: &str, session_key: &str) -> bool {
        self.len(channel_id, session_key) == 0
    }
}

/// Render archived inbounds as a context block prefixed to the next
/// forwarded turn.
#[must_use]
pub fn format_context(items: &[ArchivedInbound]) -> String {
    let mut out = String::from("[Recent unaddressed messages in this chat]\n");
    for item in items {
        out.push_str(&format!("{}: {}\n", item.sender_id, item.text));
    }
    out
}

fn chat_key(message: &ChannelMessage) -> String {
    format!("{}:{}", message.channel_id, message.session_key)
}
