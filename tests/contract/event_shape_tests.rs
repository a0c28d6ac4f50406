//! Contract tests pinning the JSON shapes of events and frames.
//!
//! UIs and channel modules parse these shapes; field names and tag values
//! are wire contracts, not implementation details.

use chrono::{TimeZone, Utc};
use happyd::events::{
    fingerprint, AgentEvent, EventStatus, PermissionMode, SessionEvent, ToolCallState,
};

#[test]
fn assistant_text_serializes_with_kind_tag() {
    let event = AgentEvent::AssistantText { content: "hi".into(), is_final: true };
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["kind"], "assistant_text");
    assert_eq!(value["content"], "hi");
    assert_eq!(value["is_final"], true);
}

#[test]
fn status_change_omits_absent_optionals() {
    let event = AgentEvent::StatusChange {
        from: EventStatus::Processing,
        to: EventStatus::Ready,
        reason: None,
        request_id: None,
    };
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["kind"], "status_change");
    assert_eq!(value["from"], "processing");
    assert_eq!(value["to"], "ready");
    assert!(value.get("reason").is_none());
    assert!(value.get("request_id").is_none());
}

#[test]
fn tool_call_carries_lifecycle_fields() {
    let event = AgentEvent::ToolCall {
        tool_id: "t1".into(),
        name: "bash".into(),
        input: serde_json::json!({"command": "ls"}),
        state: ToolCallState::AwaitingPermission,
        started_at: Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts"),
        finished_at: None,
        result: None,
        error: None,
    };
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["kind"], "tool_call");
    assert_eq!(value["state"], "awaiting_permission");
    assert!(value.get("finished_at").is_none());
}

#[test]
fn permission_modes_use_camel_case_tags() {
    assert_eq!(
        serde_json::to_value(PermissionMode::AcceptEdits).expect("serialize"),
        "acceptEdits"
    );
    assert_eq!(
        serde_json::to_value(PermissionMode::BypassPermissions).expect("serialize"),
        "bypassPermissions"
    );
    assert_eq!(serde_json::to_value(PermissionMode::Default).expect("serialize"), "default");
    assert_eq!(serde_json::to_value(PermissionMode::Plan).expect("serialize"), "plan");
}

#[test]
fn session_event_envelope_flattens_the_payload() {
    let event = AgentEvent::AssistantText { content: "x".into(), is_final: false };
    let envelope = SessionEvent {
        session_id: "s1".into(),
        seq: 7,
        at: Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts"),
        fingerprint: fingerprint(1, &event),
        event,
    };
    let value = serde_json::to_value(&envelope).expect("serialize");
    assert_eq!(value["session_id"], "s1");
    assert_eq!(value["seq"], 7);
    assert_eq!(value["kind"], "assistant_text");
    assert!(value["fingerprint"].as_str().expect("fingerprint").len() == 32);

    let back: SessionEvent = serde_json::from_value(value).expect("deserialize");
    assert_eq!(back, envelope);
}

#[test]
fn fingerprints_distinguish_tool_states_but_not_retries() {
    let running = AgentEvent::ToolCall {
        tool_id: "t1".into(),
        name: "bash".into(),
        input: serde_json::json!({}),
        state: ToolCallState::Running,
        started_at: Utc::now(),
        finished_at: None,
        result: None,
        error: None,
    };
    let succeeded = AgentEvent::ToolCall {
        tool_id: "t1".into(),
        name: "bash".into(),
        input: serde_json::json!({}),
        state: ToolCallState::Succeeded,
        started_at: Utc::now(),
        finished_at: None,
        result: None,
        error: None,
    };
    // Same turn, same tool: a retry of `running` collides (good), a state
    // transition does not (also good).
    assert_eq!(fingerprint(1, &running), fingerprint(1, &running));
    assert_ne!(fingerprint(1, &running), fingerprint(1, &succeeded));
}
