//! Contract tests for the channel adapter capability set.

use std::sync::Arc;

use happyd::bridge::adapter::{ChannelAdapter, ChannelMessage};
use happyd::bridge::simulator::{SimulatorAdapter, SIMULATOR_CHANNEL};

#[tokio::test]
async fn adapters_are_object_safe() {
    let adapter: Arc<dyn ChannelAdapter> = Arc::new(SimulatorAdapter::new());
    assert_eq!(adapter.channel_id(), SIMULATOR_CHANNEL);
    adapter.send_typing("dm:u1").await.expect("typing is best-effort Ok");
}

#[tokio::test]
async fn simulator_captures_sends_and_replies() {
    let adapter = SimulatorAdapter::new();

    adapter.send_text("dm:u1", "notice").await.expect("send");
    adapter.reply_text("m1", "answer").await.expect("reply");

    let first = adapter.take_delivery().expect("first delivery");
    assert_eq!(first.target, "dm:u1");
    assert_eq!(first.text, "notice");
    assert!(!first.is_reply);

    let second = adapter.take_delivery().expect("second delivery");
    assert_eq!(second.target, "m1");
    assert_eq!(second.text, "answer");
    assert!(second.is_reply);

    assert!(adapter.take_delivery().is_none());
}

#[tokio::test]
async fn next_delivery_awaits_a_send() {
    let adapter = Arc::new(SimulatorAdapter::new());

    let waiter = Arc::clone(&adapter);
    let handle = tokio::spawn(async move { waiter.next_delivery().await });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    adapter.send_text("dm:u1", "late").await.expect("send");

    let delivery = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("delivery before timeout")
        .expect("task");
    assert_eq!(delivery.text, "late");
}

#[test]
fn channel_message_serde_roundtrip() {
    let message = ChannelMessage {
        channel_id: "feishu".into(),
        session_key: "dm:u1".into(),
        message_id: "m1".into(),
        sender_id: "u1".into(),
        text: "hi".into(),
        reply_to_id: Some("m0".into()),
        metadata: serde_json::json!({"threadId": "t9"}),
    };
    let json = serde_json::to_string(&message).expect("serialize");
    assert!(json.contains(r#""channelId":"feishu""#));
    let back: ChannelMessage = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, message);
}
