//! Session-router behavior: single link per name, serialized workspace
//! switches with inbound buffering, reconnect.

use std::sync::Arc;
use std::time::Duration;

use happyd::bridge::policy::AllowAllPolicy;
use happyd::bridge::InboundOutcome;
use happyd::AppError;

use super::test_helpers::{build_stack, expect_user_message, inbound, RecordingAdapter};

#[tokio::test]
async fn concurrent_connects_share_one_link() {
    let stack = build_stack(1_000, |_| {});

    let (a, b) = tokio::join!(stack.router.connect("x"), stack.router.connect("x"));
    let a = a.expect("first connect");
    let b = b.expect("second connect");

    assert_eq!(a.session_id(), b.session_id());
    assert_eq!(stack.factory.connect_count(), 1, "the link must be established exactly once");
}

#[tokio::test]
async fn reads_stay_responsive_while_a_connect_is_in_flight() {
    // Zero permits: the dial blocks until the test grants one.
    let stack = build_stack(0, |_| {});
    let router = Arc::clone(&stack.router);
    let pending_connect = tokio::spawn(async move { router.connect("slow").await });

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Map reads must not wedge behind the in-flight handshake.
    let listed = tokio::time::timeout(Duration::from_millis(200), stack.router.list())
        .await
        .expect("list responds during connect");
    assert!(listed.is_empty());
    let current = tokio::time::timeout(Duration::from_millis(200), stack.router.current())
        .await
        .expect("current responds during connect");
    assert!(current.is_none());

    stack.factory.allow_connects(1);
    let handle = pending_connect.await.expect("connect task").expect("connect");
    assert_eq!(handle.session_name(), "slow");
}

#[tokio::test]
async fn connect_is_idempotent_while_alive() {
    let stack = build_stack(1_000, |_| {});
    let first = stack.router.connect("x").await.expect("connect");
    let second = stack.router.connect("x").await.expect("reconnect");
    assert_eq!(first.session_id(), second.session_id());
    assert_eq!(stack.factory.connect_count(), 1);
}

#[tokio::test]
async fn current_follows_the_most_recent_connect() {
    let stack = build_stack(1_000, |_| {});
    stack.router.connect("a").await.expect("connect a");
    stack.router.connect("b").await.expect("connect b");

    let current = stack.router.current().await.expect("current");
    assert_eq!(current.session_name(), "b");

    let listed = stack.router.list().await;
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn disconnect_denies_pending_prompts() {
    let mut stack = build_stack(1_000, |_| {});
    stack.router.connect("x").await.expect("connect");
    let remote = stack.remotes.recv().await.expect("remote");

    let _ = remote.inbound_tx.send(happyd::agent::wire::InboundFrame::Permission {
        turn: 1,
        prompt_id: "p1".into(),
        tool_name: "bash".into(),
        input: serde_json::json!({}),
        proposed_mode: happyd::events::PermissionMode::Default,
    });

    // Wait for the prompt to be registered through the pump.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !stack.permissions.list(None).is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "prompt never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    stack.router.disconnect("x").await.expect("disconnect");

    // The pump denies the prompt with `session-gone` on drain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if stack.permissions.list(None).is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "prompt never denied");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let err = stack
        .permissions
        .resolve("p1", happyd::permissions::PromptDecision::Allow, None, None)
        .expect_err("prompt already denied");
    assert!(matches!(err, AppError::AlreadyResolved(_)), "got {err:?}");
}

#[tokio::test]
async fn switch_buffers_inbounds_and_routes_them_to_the_new_session() {
    // One permit: the initial connect succeeds, the switch's reconnect
    // blocks until the test grants another permit.
    let mut stack = build_stack(1, |config| {
        config.bridge.switch_buffer_cap = 2;
    });
    let adapter = RecordingAdapter::new("feishu");
    stack
        .bridge
        .register_channel(Arc::clone(&adapter), Arc::new(AllowAllPolicy))
        .expect("register");

    stack.router.connect("main").await.expect("connect");
    let _remote1 = stack.remotes.recv().await.expect("first remote");

    let new_workspace = stack.config.data_dir().join("elsewhere");
    let switch_router = Arc::clone(&stack.router);
    let switch_path = new_workspace.clone();
    let switch = tokio::spawn(async move { switch_router.switch_workspace(&switch_path).await });

    // Wait until the gate is up (the switch has started).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !stack.router.gate().is_switching() {
        assert!(tokio::time::Instant::now() < deadline, "switch never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Two inbounds buffer; the third overflows the cap.
    for id in ["m1", "m2"] {
        let outcome = stack
            .bridge
            .handle_inbound(inbound("feishu", id, "buffered"))
            .await
            .expect("buffered inbound");
        assert_eq!(outcome, InboundOutcome::Buffered);
    }
    let err = stack
        .bridge
        .handle_inbound(inbound("feishu", "m3", "overflow"))
        .await
        .expect_err("buffer full");
    assert!(matches!(err, AppError::SwitchInProgress(_)), "got {err:?}");

    // Let the switch's reconnect proceed.
    stack.factory.allow_connects(10);
    let switched = switch.await.expect("switch task").expect("switch result");
    assert_eq!(switched.session_name(), "main");
    assert_eq!(switched.snapshot().workspace, new_workspace);

    // The buffered inbounds are accepted against the new session.
    let mut remote2 = stack.remotes.recv().await.expect("second remote");
    let (_, text_a, _) = expect_user_message(&mut remote2).await;
    let (_, text_b, _) = expect_user_message(&mut remote2).await;
    assert_eq!(text_a, "buffered");
    assert_eq!(text_b, "buffered");
}

#[tokio::test]
async fn overlapping_switches_serialize_into_distinct_transitions() {
    let stack = build_stack(1_000, |_| {});
    stack.router.connect("main").await.expect("connect");

    let target_a = stack.config.data_dir().join("a");
    let target_b = stack.config.data_dir().join("b");

    let router_a = Arc::clone(&stack.router);
    let router_b = Arc::clone(&stack.router);
    let path_a = target_a.clone();
    let path_b = target_b.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { router_a.switch_workspace(&path_a).await }),
        tokio::spawn(async move { router_b.switch_workspace(&path_b).await }),
    );
    a.expect("task a").expect("switch a");
    b.expect("task b").expect("switch b");

    // Both transitions applied in some serial order; the survivor is one
    // of the two targets and the session is alive.
    let current = stack.router.current().await.expect("current");
    let workspace = current.snapshot().workspace;
    assert!(workspace == target_a || workspace == target_b, "workspace is {workspace:?}");
}

#[tokio::test]
async fn switch_to_uncreatable_directory_fails_typed() {
    let stack = build_stack(1_000, |_| {});
    stack.router.connect("main").await.expect("connect");

    // A path under a regular file cannot be created.
    let blocker = stack.config.data_dir().join("blocker");
    std::fs::write(&blocker, "file").expect("write blocker");
    let err = stack
        .router
        .switch_workspace(&blocker.join("sub"))
        .await
        .expect_err("uncreatable dir");
    assert!(matches!(err, AppError::DirectoryNotCreatable(_)), "got {err:?}");

    // The old session still serves.
    assert!(stack.router.current().await.is_some());
}

#[tokio::test]
async fn reconnect_current_issues_a_fresh_link() {
    let stack = build_stack(1_000, |_| {});
    let first = stack.router.connect("main").await.expect("connect");
    let second = stack.router.reconnect_current().await.expect("reconnect");

    assert_eq!(second.session_name(), "main");
    assert_ne!(first.session_id(), second.session_id(), "new link, new agent session id");
    assert_eq!(stack.factory.connect_count(), 2);
}
