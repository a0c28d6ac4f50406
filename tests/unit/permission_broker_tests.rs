//! Unit tests for the permission broker: single resolution, expiry,
//! session-wide denial.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use happyd::events::PermissionMode;
use happyd::permissions::{
    PermissionBroker, PromptDecision, PromptRecord, PromptResolution, PromptResolver,
};
use happyd::AppError;

type Captured = Arc<Mutex<Vec<PromptResolution>>>;

fn record(session: &str, prompt: &str) -> PromptRecord {
    PromptRecord {
        session_id: session.into(),
        prompt_id: prompt.into(),
        tool_name: "bash".into(),
        input: serde_json::json!({"command": "ls"}),
        proposed_mode: PermissionMode::Default,
        registered_at: Utc::now(),
    }
}

fn capturing_resolver(captured: &Captured) -> PromptResolver {
    let captured = Arc::clone(captured);
    Box::new(move |resolution| {
        captured.lock().expect("capture lock").push(resolution);
    })
}

#[test]
fn resolve_invokes_the_resolver_once() {
    let broker = PermissionBroker::new();
    let captured: Captured = Arc::default();
    broker.register(record("s1", "p1"), capturing_resolver(&captured));

    broker
        .resolve("p1", PromptDecision::Allow, Some(PermissionMode::AcceptEdits), None)
        .expect("first resolve succeeds");

    let got = captured.lock().expect("lock");
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].decision, PromptDecision::Allow);
    assert_eq!(got[0].mode, Some(PermissionMode::AcceptEdits));
}

#[test]
fn second_resolution_fails_with_already_resolved() {
    let broker = PermissionBroker::new();
    let captured: Captured = Arc::default();
    broker.register(record("s1", "p1"), capturing_resolver(&captured));

    broker.resolve("p1", PromptDecision::Allow, None, None).expect("first resolve");
    let err = broker
        .resolve("p1", PromptDecision::Deny, None, None)
        .expect_err("second resolve fails");
    assert!(matches!(err, AppError::AlreadyResolved(_)), "got {err:?}");
    assert_eq!(captured.lock().expect("lock").len(), 1);
}

#[test]
fn unknown_prompt_is_distinguished() {
    let broker = PermissionBroker::new();
    let err = broker
        .resolve("nope", PromptDecision::Allow, None, None)
        .expect_err("unknown prompt");
    assert!(matches!(err, AppError::UnknownPrompt(_)), "got {err:?}");
}

#[test]
fn re_registration_is_ignored() {
    let broker = PermissionBroker::new();
    let captured: Captured = Arc::default();
    broker.register(record("s1", "p1"), capturing_resolver(&captured));
    // Remote replay after reconnect re-sends the prompt.
    broker.register(record("s1", "p1"), capturing_resolver(&captured));

    assert_eq!(broker.list(None).len(), 1);
    broker.resolve("p1", PromptDecision::Allow, None, None).expect("resolve");
    assert_eq!(captured.lock().expect("lock").len(), 1);
}

#[test]
fn list_scopes_by_session() {
    let broker = PermissionBroker::new();
    let captured: Captured = Arc::default();
    broker.register(record("s1", "p1"), capturing_resolver(&captured));
    broker.register(record("s1", "p2"), capturing_resolver(&captured));
    broker.register(record("s2", "p3"), capturing_resolver(&captured));

    assert_eq!(broker.list(None).len(), 3);
    assert_eq!(broker.list(Some("s1")).len(), 2);
    assert_eq!(broker.list(Some("s2")).len(), 1);
    assert_eq!(broker.list(Some("missing")).len(), 0);
}

#[test]
fn expire_older_than_denies_with_timeout_reason() {
    let broker = PermissionBroker::new();
    let captured: Captured = Arc::default();
    broker.register(record("s1", "old"), capturing_resolver(&captured));

    let expired = broker.expire_older_than(Utc::now() + Duration::seconds(1));
    assert_eq!(expired, 1);

    let got = captured.lock().expect("lock");
    assert_eq!(got[0].decision, PromptDecision::Deny);
    assert_eq!(got[0].reason.as_deref(), Some("timeout"));
    assert!(broker.list(None).is_empty());
}

#[test]
fn expire_spares_newer_prompts() {
    let broker = PermissionBroker::new();
    let captured: Captured = Arc::default();
    broker.register(record("s1", "fresh"), capturing_resolver(&captured));

    let expired = broker.expire_older_than(Utc::now() - Duration::hours(1));
    assert_eq!(expired, 0);
    assert_eq!(broker.list(None).len(), 1);
}

#[test]
fn session_disconnect_denies_all_pending_with_session_gone() {
    let broker = PermissionBroker::new();
    let captured: Captured = Arc::default();
    broker.register(record("s1", "p1"), capturing_resolver(&captured));
    broker.register(record("s1", "p2"), capturing_resolver(&captured));
    broker.register(record("s2", "p3"), capturing_resolver(&captured));

    broker.deny_session("s1");

    let got = captured.lock().expect("lock");
    assert_eq!(got.len(), 2);
    assert!(got.iter().all(|r| r.decision == PromptDecision::Deny));
    assert!(got.iter().all(|r| r.reason.as_deref() == Some("session-gone")));
    drop(got);

    // The other session's prompt is untouched and still resolvable.
    assert_eq!(broker.list(None).len(), 1);
    broker.resolve("p3", PromptDecision::Allow, None, None).expect("resolve p3");
}
