//! Unit tests for channel policy evaluation order.

use happyd::bridge::adapter::ChannelMessage;
use happyd::bridge::policy::{AllowAllPolicy, ChannelPolicy, PolicyVerdict, RulePolicy};
use regex::Regex;

fn msg(sender: &str, text: &str) -> ChannelMessage {
    ChannelMessage {
        channel_id: "feishu".into(),
        session_key: "dm:u1".into(),
        message_id: "m1".into(),
        sender_id: sender.into(),
        text: text.into(),
        reply_to_id: None,
        metadata: serde_json::Value::Null,
    }
}

#[test]
fn allow_all_forwards_everything() {
    assert_eq!(AllowAllPolicy.evaluate(&msg("anyone", "hi")), PolicyVerdict::Forward);
}

#[test]
fn permissive_rule_policy_forwards() {
    assert_eq!(RulePolicy::permissive().evaluate(&msg("u1", "hi")), PolicyVerdict::Forward);
}

#[test]
fn deny_list_wins_over_everything() {
    let policy = RulePolicy {
        deny_senders: vec!["banned".into()],
        allow_senders: vec!["banned".into()],
        require_mention: None,
    };
    assert!(matches!(policy.evaluate(&msg("banned", "@bot hi")), PolicyVerdict::Deny { .. }));
}

#[test]
fn allow_list_is_exhaustive_when_present() {
    let policy = RulePolicy {
        deny_senders: vec![],
        allow_senders: vec!["u1".into()],
        require_mention: None,
    };
    assert_eq!(policy.evaluate(&msg("u1", "hi")), PolicyVerdict::Forward);
    assert!(matches!(policy.evaluate(&msg("u2", "hi")), PolicyVerdict::Deny { .. }));
}

#[test]
fn missing_mention_archives_instead_of_denying() {
    let policy = RulePolicy {
        deny_senders: vec![],
        allow_senders: vec![],
        require_mention: Some(Regex::new(r"@bot\b").expect("regex")),
    };
    assert!(matches!(
        policy.evaluate(&msg("u1", "just chatting")),
        PolicyVerdict::Archive { .. }
    ));
    assert_eq!(policy.evaluate(&msg("u1", "@bot do the thing")), PolicyVerdict::Forward);
}
