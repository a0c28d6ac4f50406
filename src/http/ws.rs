//! WebSocket event feed.
//!
//! Pushes `{topic, data}` frames to UI clients: a `happy:status` snapshot
//! on connect, then the bus subscription's deliveries. A `from_seq` query
//! parameter requests a ledger replay spliced ahead of live events, so a
//! refreshing UI misses nothing.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::bus::{BusEvent, Delivery, DropPolicy, SubscriptionFilter};
use crate::events::EventKind;
use crate::http::{status_snapshot, AppState};

/// Query parameters for the WS upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    /// Session to replay before live events.
    pub session_id: Option<String>,
    /// Replay starting sequence (inclusive).
    #[serde(default)]
    pub from_seq: u64,
}

/// `GET /ws` — upgrade and stream the event feed.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, query))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, query: WsQuery) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Current status first, so the UI renders before any event arrives.
    let hello = frame("happy:status", status_snapshot(&state).await);
    if ws_tx.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }

    let sub = state.bus.subscribe(SubscriptionFilter::all(), None, DropPolicy::DropOldest);
    if let Some(ref session_id) = query.session_id {
        state.bus.replay(&sub, session_id, query.from_seq);
    }

    loop {
        tokio::select! {
            delivery = sub.recv() => {
                let Some(delivery) = delivery else { break };
                let payload = match delivery {
                    Delivery::Gap { session_id, from, to } => {
                        frame("happy:gap", json!({ "sessionId": session_id, "from": from, "to": to }))
                    }
                    Delivery::Event(event) => {
                        let (topic, data) = topic_of(&event);
                        frame(topic, data)
                    }
                };
                if ws_tx.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(%err, "ws client error");
                        break;
                    }
                    // The feed is one-way; client frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("ws client disconnected");
}

fn frame(topic: &str, data: Value) -> Value {
    json!({ "topic": topic, "data": data })
}

/// Map a bus event to its wire topic and payload.
#[must_use]
pub fn topic_of(event: &BusEvent) -> (&'static str, Value) {
    match event {
        BusEvent::Session(ev) => {
            let data = serde_json::to_value(ev).unwrap_or(Value::Null);
            let topic = match ev.event.event_kind() {
                EventKind::AssistantText | EventKind::ToolCall | EventKind::PermissionPrompt => {
                    "happy:message"
                }
                EventKind::StatusChange => "happy:eventStatus",
                EventKind::UsageUpdate => "happy:usage",
                EventKind::Error => "happy:error",
            };
            (topic, data)
        }
        BusEvent::SessionLifecycle { session_name, session_id, connected } => {
            let data = json!({ "sessionName": session_name, "sessionId": session_id });
            if *connected {
                ("happy:connected", data)
            } else {
                ("happy:disconnected", data)
            }
        }
        BusEvent::WorkspaceSwitched { session_name, path } => (
            "happy:workDirSwitched",
            json!({ "sessionName": session_name, "path": path }),
        ),
        BusEvent::SwitchFailed { session_name, kind, message } => (
            "happy:error",
            json!({ "sessionName": session_name, "kind": kind, "message": message }),
        ),
        BusEvent::SecretChanged { key } => ("happy:secretChanged", json!({ "key": key })),
        BusEvent::MessagesRestored { session_id, count } => (
            "happy:messagesRestored",
            json!({ "sessionId": session_id, "count": count }),
        ),
        BusEvent::DaemonStatusChanged { running, pid } => {
            ("daemon:statusChanged", json!({ "running": running, "pid": pid }))
        }
        BusEvent::DaemonStartProgress { phase, percent } => {
            ("daemon:startProgress", json!({ "phase": phase, "percent": percent }))
        }
        BusEvent::DaemonFailed { kind, message } => {
            ("happy:error", json!({ "kind": kind, "message": message, "retriable": false }))
        }
        BusEvent::FileChanged { paths } => ("happy:filesChanged", json!({ "paths": paths })),
        BusEvent::Initialized => ("happy:initialized", json!({})),
    }
}
