//! Per-channel inbound policy.
//!
//! Consulted before a message is routed to the agent. A *decorative*
//! rejection (e.g. the bot was not mentioned) archives the inbound into
//! the chat's rolling scrollback so the agent still sees it as context on
//! the next forwarded turn; a *hostile* rejection (denied sender) causes
//! no archival at all.

use regex::Regex;

use crate::bridge::adapter::ChannelMessage;

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Route the message to the agent.
    Forward,
    /// Do not route, but archive into the chat scrollback.
    Archive {
        /// Why the message was held back.
        reason: String,
    },
    /// Do not route and do not archive.
    Deny {
        /// Why the message was rejected.
        reason: String,
    },
}

/// Policy hook evaluated per inbound message.
pub trait ChannelPolicy: Send + Sync {
    /// Classify one inbound message.
    fn evaluate(&self, message: &ChannelMessage) -> PolicyVerdict;
}

/// Policy that forwards everything. The simulator channel uses this.
pub struct AllowAllPolicy;

impl ChannelPolicy for AllowAllPolicy {
    fn evaluate(&self, _message: &ChannelMessage) -> PolicyVerdict {
        PolicyVerdict::Forward
    }
}

/// Rule-based policy: sender deny/allow lists plus optional
/// mention-required gating.
pub struct RulePolicy {
    /// Senders always rejected (hostile).
    pub deny_senders: Vec<String>,
    /// When non-empty, only these senders are forwarded; others are
    /// rejected (hostile).
    pub allow_senders: Vec<String>,
    /// When set, messages not matching the pattern are archived
    /// (decorative rejection), not forwarded.
    pub require_mention: Option<Regex>,
}

impl RulePolicy {
    /// Policy with no rules (forwards everything).
    #[must_use]
    pub fn permissive() -> Self {
        Self { deny_senders: vec![], allow_senders: vec![], require_mention: None }
    }
}

impl ChannelPolicy for RulePolicy {
    fn evaluate(&self, message: &ChannelMessage) -> PolicyVerdict {
        // 1. Deny list wins.
        if self.deny_senders.iter().any(|s| s == &message.sender_id) {
            return PolicyVerdict::Deny { reason: format!("sender '{}' denied", message.sender_id) };
        }

        // 2. Allow list, when present, is exhaustive.
        if !self.allow_senders.is_empty()
            && !self.allow_senders.iter().any(|s| s == &message.sender_id)
        {
            return PolicyVerdict::Deny {
                reason: format!("sender '{}' not in allow list", message.sender_id),
            };
        }

        // 3. Mention gating is decorative: the message is context, not a
        // request.
        if let Some(ref mention) = self.require_mention {
            if !mention.is_match(&message.text) {
                return PolicyVerdict::Archive { reason: "not mentioned".into() };
            }
        }

        PolicyVerdict::Forward
    }
}
