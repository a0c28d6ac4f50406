//! Unit tests for the rolling per-chat scrollback.

use happyd::bridge::adapter::ChannelMessage;
use happyd::bridge::scrollback::{format_context, Scrollback};

fn msg(channel: &str, chat: &str, sender: &str, text: &str) -> ChannelMessage {
    ChannelMessage {
        channel_id: channel.into(),
        session_key: chat.into(),
        message_id: format!("m-{text}"),
        sender_id: sender.into(),
        text: text.into(),
        reply_to_id: None,
        metadata: serde_json::Value::Null,
    }
}

#[test]
fn push_then_drain_returns_in_order() {
    let scrollback = Scrollback::new(10);
    scrollback.push(&msg("feishu", "dm:u1", "u1", "first"));
    scrollback.push(&msg("feishu", "dm:u1", "u2", "second"));

    let drained = scrollback.drain(&msg("feishu", "dm:u1", "u1", "trigger"));
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].text, "first");
    assert_eq!(drained[1].text, "second");

    // Drain empties the chat.
    assert!(scrollback.is_empty("feishu", "dm:u1"));
}

#[test]
fn cap_evicts_oldest() {
    let scrollback = Scrollback::new(3);
    for i in 0..6 {
        scrollback.push(&msg("feishu", "dm:u1", "u1", &format!("n{i}")));
    }
    let drained = scrollback.drain(&msg("feishu", "dm:u1", "u1", "trigger"));
    let texts: Vec<&str> = drained.iter().map(|a| a.text.as_str()).collect();
    assert_eq!(texts, vec!["n3", "n4", "n5"]);
}

#[test]
fn chats_are_scoped_by_channel_and_key() {
    let scrollback = Scrollback::new(10);
    scrollback.push(&msg("feishu", "dm:u1", "u1", "a"));
    scrollback.push(&msg("feishu", "dm:u2", "u2", "b"));
    scrollback.push(&msg("slack", "dm:u1", "u1", "c"));

    assert_eq!(scrollback.len("feishu", "dm:u1"), 1);
    assert_eq!(scrollback.len("feishu", "dm:u2"), 1);
    assert_eq!(scrollback.len("slack", "dm:u1"), 1);

    let drained = scrollback.drain(&msg("feishu", "dm:u1", "u1", "t"));
    assert_eq!(drained[0].text, "a");
    assert_eq!(scrollback.len("feishu", "dm:u2"), 1);
}

#[test]
fn context_block_names_senders() {
    let scrollback = Scrollback::new(10);
    scrollback.push(&msg("feishu", "dm:u1", "alice", "hello there"));
    let drained = scrollback.drain(&msg("feishu", "dm:u1", "bob", "t"));

    let context = format_context(&drained);
    assert!(context.contains("alice: hello there"));
}
