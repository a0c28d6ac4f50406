//! Contract tests for the WebSocket topic mapping.

use chrono::Utc;
use happyd::bus::BusEvent;
use happyd::events::{AgentEvent, EventStatus, SessionEvent};
use happyd::http::ws::topic_of;

fn session_event(event: AgentEvent) -> BusEvent {
    BusEvent::Session(SessionEvent {
        session_id: "s1".into(),
        seq: 1,
        at: Utc::now(),
        fingerprint: happyd::events::fingerprint(1, &event),
        event,
    })
}

#[test]
fn assistant_text_maps_to_happy_message() {
    let (topic, data) = topic_of(&session_event(AgentEvent::AssistantText {
        content: "hi".into(),
        is_final: false,
    }));
    assert_eq!(topic, "happy:message");
    assert_eq!(data["content"], "hi");
}

#[test]
fn status_change_maps_to_event_status() {
    let (topic, _) = topic_of(&session_event(AgentEvent::StatusChange {
        from: EventStatus::Processing,
        to: EventStatus::Ready,
        reason: None,
        request_id: None,
    }));
    assert_eq!(topic, "happy:eventStatus");
}

#[test]
fn usage_maps_to_happy_usage() {
    let (topic, _) = topic_of(&session_event(AgentEvent::UsageUpdate {
        input_tokens: 1,
        output_tokens: 2,
        cache_read_tokens: 3,
        context_size: 4,
    }));
    assert_eq!(topic, "happy:usage");
}

#[test]
fn errors_map_to_happy_error() {
    let (topic, data) = topic_of(&session_event(AgentEvent::Error {
        kind: "LinkLost".into(),
        message: "gone".into(),
        retriable: true,
    }));
    assert_eq!(topic, "happy:error");
    assert_eq!(data["kind"], "LinkLost");
}

#[test]
fn lifecycle_maps_to_connected_and_disconnected() {
    let (topic, data) = topic_of(&BusEvent::SessionLifecycle {
        session_name: "main".into(),
        session_id: Some("s1".into()),
        connected: true,
    });
    assert_eq!(topic, "happy:connected");
    assert_eq!(data["sessionName"], "main");

    let (topic, _) = topic_of(&BusEvent::SessionLifecycle {
        session_name: "main".into(),
        session_id: Some("s1".into()),
        connected: false,
    });
    assert_eq!(topic, "happy:disconnected");
}

#[test]
fn infrastructure_topics_are_stable() {
    let cases: Vec<(BusEvent, &str)> = vec![
        (
            BusEvent::WorkspaceSwitched { session_name: "main".into(), path: "/w".into() },
            "happy:workDirSwitched",
        ),
        (BusEvent::SecretChanged { key: "access_key".into() }, "happy:secretChanged"),
        (
            BusEvent::MessagesRestored { session_id: "s1".into(), count: 3 },
            "happy:messagesRestored",
        ),
        (BusEvent::DaemonStatusChanged { running: true, pid: Some(1) }, "daemon:statusChanged"),
        (
            BusEvent::DaemonStartProgress { phase: "spawn".into(), percent: 40 },
            "daemon:startProgress",
        ),
        (BusEvent::Initialized, "happy:initialized"),
    ];
    for (event, expected) in cases {
        let (topic, _) = topic_of(&event);
        assert_eq!(topic, expected);
    }
}

#[test]
fn daemon_failures_surface_as_errors() {
    let (topic, data) = topic_of(&BusEvent::DaemonFailed {
        kind: "CrashLoop".into(),
        message: "two crashes".into(),
    });
    assert_eq!(topic, "happy:error");
    assert_eq!(data["retriable"], false);
}
