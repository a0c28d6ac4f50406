//! Local HTTP/WebSocket API.
//!
//! Thin route handlers over the core components; every response is JSON
//! `{success: bool, ...}` and error bodies carry the stable error kind.
//! The WebSocket feed lives in [`ws`]; the browser-extension control
//! plane (separate port, opaque frames) in [`extension`].

pub mod extension;
pub mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::adapter::ChannelMessage;
use crate::bridge::simulator::SIMULATOR_CHANNEL;
use crate::bridge::{ChannelBridge, InboundOutcome};
use crate::bus::{BusEvent, EventBus};
use crate::config::GlobalConfig;
use crate::events::PermissionMode;
use crate::ledger::MessageLedger;
use crate::permissions::{PermissionBroker, PromptDecision};
use crate::router::SessionRouter;
use crate::settings::SettingsStore;
use crate::supervisor::{credentials, Supervisor};
use crate::{AppError, Result};

/// Shared state handed to every route handler.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Settings and secret store.
    pub settings: Arc<SettingsStore>,
    /// Session router.
    pub router: Arc<SessionRouter>,
    /// Channel bridge.
    pub bridge: Arc<ChannelBridge>,
    /// Event bus.
    pub bus: Arc<EventBus>,
    /// Message ledger.
    pub ledger: Arc<MessageLedger>,
    /// Child supervisor.
    pub supervisor: Arc<Supervisor>,
    /// Permission broker.
    pub permissions: Arc<PermissionBroker>,
    /// Daemon start time.
    pub started_at: DateTime<Utc>,
    /// Extension control-plane hub.
    pub extension: Arc<extension::ExtensionHub>,
    /// Daemon-wide shutdown token; `/api/shutdown` fires it.
    pub shutdown: CancellationToken,
}

/// Serve the HTTP/WebSocket API until the token fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the port cannot be bound.
pub async fn serve_http(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind: SocketAddr = format!("{}:{}", state.config.http.bind, state.config.http.port)
        .parse()
        .map_err(|err| AppError::Config(format!("invalid http bind address: {err}")))?;

    let app = axum::Router::new()
        .route("/api/status", get(api_status))
        .route("/api/ai/status", get(ai_status))
        .route("/api/ai/connect", post(ai_connect))
        .route("/api/ai/disconnect", post(ai_disconnect))
        .route("/api/ai/message", post(ai_message))
        .route("/api/ai/messages", get(ai_messages))
        .route("/api/ai/usage", get(ai_usage))
        .route("/api/ai/permissions", get(ai_permissions))
        .route("/api/ai/permission/allow", post(ai_permission_allow))
        .route("/api/ai/permission/deny", post(ai_permission_deny))
        .route("/api/ai/abort", post(ai_abort))
        .route("/api/ai/sessions", get(ai_sessions))
        .route("/api/ai/session/reconnect", post(ai_session_reconnect))
        .route("/api/ai/session/{name}", get(ai_session))
        .route("/api/ai/workspace", post(ai_workspace))
        .route("/api/daemon/status", get(daemon_status))
        .route("/api/daemon/start", post(daemon_start))
        .route("/api/daemon/stop", post(daemon_stop))
        .route("/api/daemon/restart", post(daemon_restart))
        .route("/api/settings", get(settings_get).post(settings_set))
        .route("/api/settings/secret", post(settings_secret))
        .route("/api/extension/request", post(extension_request))
        .route("/api/shutdown", post(api_shutdown))
        .route("/ws", get(ws::ws_handler))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;

    info!(%bind, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("HTTP server error: {err}")))?;

    info!("HTTP API shut down");
    Ok(())
}

// ── Error mapping ────────────────────────────────────────────────────────────

fn error_response(err: &AppError) -> Response {
    let status = match err {
        AppError::UnknownSession(_) | AppError::UnknownPrompt(_) | AppError::UnknownChannel(_) => {
            StatusCode::NOT_FOUND
        }
        AppError::Config(_)
        | AppError::Serde(_)
        | AppError::AlreadyResolved(_)
        | AppError::AlreadyConnected(_)
        | AppError::PolicyRejected(_)
        | AppError::DirectoryNotCreatable(_) => StatusCode::BAD_REQUEST,
        AppError::NotConnected(_)
        | AppError::NetworkUnavailable(_)
        | AppError::CredentialsMissing(_)
        | AppError::SwitchInProgress(_)
        | AppError::Throttled(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({ "success": false, "error": err.message(), "kind": err.kind() });
    (status, Json(body)).into_response()
}

fn ok(body: Value) -> Response {
    let mut body = body;
    if let Value::Object(ref mut map) = body {
        map.insert("success".into(), Value::Bool(true));
    }
    (StatusCode::OK, Json(body)).into_response()
}

fn respond(result: Result<Value>) -> Response {
    match result {
        Ok(body) => ok(body),
        Err(err) => error_response(&err),
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

/// Status snapshot shared by `/api/status` and the WS hello push.
pub async fn status_snapshot(state: &AppState) -> Value {
    let session = state.router.current().await.map(|h| h.snapshot());
    let daemon = state.supervisor.status().await;
    let needs_login = !credentials::credentials_present(&state.config, &state.settings);
    json!({
        "running": true,
        "startedAt": state.started_at,
        "needsLogin": needs_login,
        "session": session,
        "daemon": daemon,
    })
}

async fn api_status(State(state): State<Arc<AppState>>) -> Response {
    ok(status_snapshot(&state).await)
}

async fn api_shutdown(State(state): State<Arc<AppState>>) -> Response {
    info!("shutdown requested over HTTP");
    state.shutdown.cancel();
    ok(json!({}))
}

// ── AI control ───────────────────────────────────────────────────────────────

async fn ai_status(State(state): State<Arc<AppState>>) -> Response {
    let sessions = state.router.list().await;
    let current = state.router.current().await.map(|h| h.snapshot());
    ok(json!({ "current": current, "sessions": sessions }))
}

#[derive(Deserialize)]
struct ConnectBody {
    session_name: Option<String>,
}

async fn ai_connect(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConnectBody>,
) -> Response {
    let name = body.session_name.unwrap_or_else(|| crate::router::DEFAULT_SESSION.to_owned());
    respond(
        state
            .router
            .connect(&name)
            .await
            .map(|handle| json!({ "session": handle.snapshot() })),
    )
}

#[derive(Deserialize)]
struct DisconnectBody {
    session_name: Option<String>,
}

async fn ai_disconnect(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DisconnectBody>,
) -> Response {
    let result = match body.session_name {
        Some(name) => state.router.disconnect(&name).await.map(|()| json!({})),
        None => {
            state.router.disconnect_all().await;
            Ok(json!({}))
        }
    };
    respond(result)
}

#[derive(Deserialize)]
struct MessageBody {
    text: String,
    #[serde(default)]
    session_key: Option<String>,
}

/// The HTTP message route is just another inbound through the simulator
/// channel; replies surface on the WS feed and the simulator outbox.
async fn ai_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MessageBody>,
) -> Response {
    if body.text.trim().is_empty() {
        return error_response(&AppError::Config("text must not be empty".into()));
    }
    let message = ChannelMessage {
        channel_id: SIMULATOR_CHANNEL.to_owned(),
        session_key: body.session_key.unwrap_or_else(|| "local".to_owned()),
        message_id: uuid::Uuid::new_v4().to_string(),
        sender_id: "local-user".to_owned(),
        text: body.text,
        reply_to_id: None,
        metadata: Value::Null,
    };
    respond(state.bridge.handle_inbound(message).await.map(|outcome| match outcome {
        InboundOutcome::Accepted { request_id } => {
            json!({ "requestId": request_id, "accepted": true })
        }
        InboundOutcome::Archived => json!({ "accepted": false, "archived": true }),
        InboundOutcome::Buffered => json!({ "accepted": true, "buffered": true }),
    }))
}

#[derive(Deserialize)]
struct MessagesQuery {
    session_id: Option<String>,
    #[serde(default)]
    from_seq: u64,
}

async fn ai_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    let session_id = match query.session_id {
        Some(id) => id,
        None => match state.router.current().await {
            Some(handle) => handle.session_id().to_owned(),
            None => return error_response(&AppError::UnknownSession("no current session".into())),
        },
    };
    let events = state.ledger.snapshot(&session_id, query.from_seq);
    let size = state.ledger.size(&session_id);
    ok(json!({
        "sessionId": session_id,
        "count": size.count,
        "events": events,
    }))
}

async fn ai_usage(State(state): State<Arc<AppState>>) -> Response {
    match state.router.current().await {
        Some(handle) => ok(json!({ "usage": handle.snapshot().usage })),
        None => error_response(&AppError::UnknownSession("no current session".into())),
    }
}

async fn ai_permissions(State(state): State<Arc<AppState>>) -> Response {
    ok(json!({ "prompts": state.permissions.list(None) }))
}

#[derive(Deserialize)]
struct PermissionBody {
    prompt_id: String,
    #[serde(default)]
    mode: Option<PermissionMode>,
    #[serde(default)]
    allowed_tools: Option<Vec<String>>,
}

async fn ai_permission_allow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PermissionBody>,
) -> Response {
    respond(
        state
            .permissions
            .resolve(&body.prompt_id, PromptDecision::Allow, body.mode, body.allowed_tools)
            .map(|()| json!({})),
    )
}

async fn ai_permission_deny(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PermissionBody>,
) -> Response {
    respond(
        state
            .permissions
            .resolve(&body.prompt_id, PromptDecision::Deny, None, None)
            .map(|()| json!({})),
    )
}

#[derive(Deserialize)]
struct AbortBody {
    #[serde(default)]
    request_id: Option<String>,
}

async fn ai_abort(State(state): State<Arc<AppState>>, Json(body): Json<AbortBody>) -> Response {
    let Some(handle) = state.router.current().await else {
        return error_response(&AppError::NotConnected("no current session".into()));
    };
    respond(handle.abort(body.request_id).await.map(|()| json!({})))
}

async fn ai_sessions(State(state): State<Arc<AppState>>) -> Response {
    ok(json!({ "sessions": state.router.list().await }))
}

async fn ai_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.router.session(&name).await {
        Some(handle) => ok(json!({ "session": handle.snapshot() })),
        None => error_response(&AppError::UnknownSession(format!("no session '{name}'"))),
    }
}

async fn ai_session_reconnect(State(state): State<Arc<AppState>>) -> Response {
    respond(
        state
            .router
            .reconnect_current()
            .await
            .map(|handle| json!({ "session": handle.snapshot() })),
    )
}

#[derive(Deserialize)]
struct WorkspaceBody {
    path: String,
}

async fn ai_workspace(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WorkspaceBody>,
) -> Response {
    respond(
        state
            .router
            .switch_workspace(&PathBuf::from(&body.path))
            .await
            .map(|handle| json!({ "session": handle.snapshot() })),
    )
}

// ── Daemon control ───────────────────────────────────────────────────────────

async fn daemon_status(State(state): State<Arc<AppState>>) -> Response {
    ok(json!({ "daemon": state.supervisor.status().await }))
}

async fn daemon_start(State(state): State<Arc<AppState>>) -> Response {
    respond(state.supervisor.ensure_running().await.map(|s| json!({ "daemon": s })))
}

#[derive(Deserialize)]
struct StopBody {
    #[serde(default = "default_true")]
    graceful: bool,
}

fn default_true() -> bool {
    true
}

async fn daemon_stop(State(state): State<Arc<AppState>>, Json(body): Json<StopBody>) -> Response {
    respond(state.supervisor.stop(body.graceful).await.map(|()| json!({})))
}

async fn daemon_restart(State(state): State<Arc<AppState>>) -> Response {
    respond(state.supervisor.restart().await.map(|s| json!({ "daemon": s })))
}

// ── Settings ─────────────────────────────────────────────────────────────────

async fn settings_get(State(state): State<Arc<AppState>>) -> Response {
    respond(state.settings.load_settings().map(|s| json!({ "settings": s })))
}

async fn settings_set(
    State(state): State<Arc<AppState>>,
    Json(body): Json<crate::settings::Settings>,
) -> Response {
    respond(state.settings.save_settings(&body).map(|()| json!({})))
}

#[derive(Deserialize)]
struct SecretBody {
    key: String,
    value: String,
}

/// Writing a secret publishes `happy:secretChanged`; the supervisor's
/// rotation task restarts the child and reconnects the current session.
async fn settings_secret(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SecretBody>,
) -> Response {
    if body.key.trim().is_empty() {
        return error_response(&AppError::Config("secret key must not be empty".into()));
    }
    respond(state.settings.set_secret(&body.key, &body.value).map(|()| {
        state.bus.publish_infra(BusEvent::SecretChanged { key: body.key.clone() });
        json!({})
    }))
}

// ── Extension control plane ──────────────────────────────────────────────────

async fn extension_request(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    respond(state.extension.request(body).await.map(|reply| json!({ "reply": reply })))
}
