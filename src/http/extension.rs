//! Browser-extension control plane.
//!
//! A separate WebSocket listener whose frames are opaque request/response
//! pairs: the daemon wraps each outgoing request in `{id, payload}` and
//! matches responses by `id`. Nothing here interprets the extension's
//! protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Hub tracking connected extension clients and in-flight requests.
pub struct ExtensionHub {
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    next_client: AtomicU64,
    request_timeout: Duration,
}

impl ExtensionHub {
    /// Create a hub with the given per-request timeout.
    #[must_use]
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            request_timeout,
        })
    }

    /// Number of connected extension clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Send an opaque request to the extension and await its response.
    ///
    /// # Errors
    ///
    /// - `AppError::UnknownChannel` — no extension is connected.
    /// - `AppError::TurnTimeout` — no response within the configured window.
    pub async fn request(&self, payload: Value) -> Result<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let envelope = json!({ "id": id, "payload": payload }).to_string();

        let (reply_tx, reply_rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.clone(), reply_tx);
        }

        let delivered = {
            let Ok(clients) = self.clients.lock() else {
                return Err(AppError::Io("extension registry unavailable".into()));
            };
            let mut any = false;
            for tx in clients.values() {
                if tx.send(envelope.clone()).is_ok() {
                    any = true;
                }
            }
            any
        };
        if !delivered {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(AppError::UnknownChannel("no extension connected".into()));
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) | Err(_) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }
                Err(AppError::TurnTimeout("extension did not respond".into()))
            }
        }
    }

    fn resolve(&self, id: &str, value: Value) {
        let tx = self.pending.lock().ok().and_then(|mut p| p.remove(id));
        match tx {
            Some(tx) => {
                let _ = tx.send(value);
            }
            None => debug!(id, "extension response for unknown request"),
        }
    }
}

/// Serve the extension WebSocket listener until the token fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the port cannot be bound.
pub async fn serve_extension(
    hub: Arc<ExtensionHub>,
    bind: &str,
    port: u16,
    ct: CancellationToken,
) -> Result<()> {
    let bind: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(|err| AppError::Config(format!("invalid extension bind address: {err}")))?;

    let app = axum::Router::new().route("/ws", get(ext_ws_handler)).with_state(hub);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind extension on {bind}: {err}")))?;

    info!(%bind, "extension control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("extension server error: {err}")))?;
    Ok(())
}

async fn ext_ws_handler(
    State(hub): State<Arc<ExtensionHub>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_extension(socket, hub))
}

async fn handle_extension(socket: WebSocket, hub: Arc<ExtensionHub>) {
    let client_id = hub.next_client.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if let Ok(mut clients) = hub.clients.lock() {
        clients.insert(client_id, tx);
    }
    info!(client_id, "extension connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(text) = outbound else { break };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Value>(text.as_str()) {
                            Ok(value) => {
                                if let Some(id) = value.get("id").and_then(Value::as_str) {
                                    let payload =
                                        value.get("payload").cloned().unwrap_or(Value::Null);
                                    hub.resolve(&id.to_owned(), payload);
                                }
                            }
                            Err(err) => warn!(%err, "unparseable extension frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Ok(mut clients) = hub.clients.lock() {
        clients.remove(&client_id);
    }
    info!(client_id, "extension disconnected");
}
