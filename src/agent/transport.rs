//! Duplex transport to the agent.
//!
//! The daemon never interprets the cryptography between the local agent
//! child and its backend; it only exchanges [`wire`] frames over a local
//! stream. The production transport dials the supervised child's
//! WebSocket port; [`pair`] provides an in-process transport for
//! harnesses driving the session worker directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::agent::wire::{self, InboundFrame, OutboundFrame};
use crate::supervisor::Supervisor;
use crate::{AppError, Result};

/// Boxed future alias used by the dyn-safe transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An established duplex frame stream to the agent.
pub trait AgentTransport: Send {
    /// Send one frame.
    fn send(&mut self, frame: OutboundFrame) -> BoxFuture<'_, Result<()>>;

    /// Receive the next frame; `Ok(None)` is a clean EOF.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<InboundFrame>>>;

    /// Close the stream; safe to call in any state.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Factory establishing transports, one per (re)connect attempt.
pub trait TransportFactory: Send + Sync {
    /// Establish a fresh transport for the named session.
    fn connect(&self, session_name: &str) -> BoxFuture<'_, Result<Box<dyn AgentTransport>>>;
}

// ── WebSocket transport ──────────────────────────────────────────────────────

/// WebSocket transport to the supervised agent child.
pub struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Dial `ws://127.0.0.1:<port>/agent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NetworkUnavailable` if the dial fails.
    pub async fn dial(port: u16) -> Result<Self> {
        let url = format!("ws://127.0.0.1:{port}/agent");
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|err| AppError::NetworkUnavailable(format!("dial {url}: {err}")))?;
        Ok(Self { ws })
    }
}

impl AgentTransport for WsTransport {
    fn send(&mut self, frame: OutboundFrame) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let line = wire::encode_outbound(&frame)?;
            self.ws
                .send(Message::Text(line.into()))
                .await
                .map_err(|err| AppError::LinkLost(format!("ws send: {err}")))
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<InboundFrame>>> {
        Box::pin(async move {
            loop {
                match self.ws.next().await {
                    None => return Ok(None),
                    Some(Err(err)) => {
                        return Err(AppError::LinkLost(format!("ws recv: {err}")));
                    }
                    Some(Ok(Message::Text(text))) => match wire::parse_inbound_line(text.as_str()) {
                        Ok(Some(frame)) => return Ok(Some(frame)),
                        Ok(None) => {}
                        Err(err) => {
                            debug!(%err, "skipping unparseable frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // Binary, ping, pong frames carry no agent payload.
                    Some(Ok(_)) => {}
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.ws.close(None).await;
        })
    }
}

/// Factory that ensures the supervised child is running and dials its port.
pub struct DaemonTransportFactory {
    supervisor: Arc<Supervisor>,
}

impl DaemonTransportFactory {
    /// Create a factory backed by the given supervisor.
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

impl TransportFactory for DaemonTransportFactory {
    fn connect(&self, session_name: &str) -> BoxFuture<'_, Result<Box<dyn AgentTransport>>> {
        let session_name = session_name.to_owned();
        Box::pin(async move {
            let status = self.supervisor.ensure_running().await?;
            let port = status.port.ok_or_else(|| {
                AppError::NetworkUnavailable("agent child reported no port".into())
            })?;
            debug!(session_name, port, "dialing agent child");
            let transport = WsTransport::dial(port).await?;
            Ok(Box::new(transport) as Box<dyn AgentTransport>)
        })
    }
}

// ── In-process pair transport ────────────────────────────────────────────────

/// Daemon-side half of an in-process transport pair.
pub struct PairTransport {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
    closed: bool,
}

/// Remote-side half: what the "agent" sees.
pub struct RemoteEnd {
    /// Frames the daemon sent.
    pub outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    /// Sender for frames toward the daemon; dropping it is an EOF.
    pub inbound_tx: mpsc::UnboundedSender<InboundFrame>,
}

/// Create an in-process transport pair.
#[must_use]
pub fn pair() -> (PairTransport, RemoteEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        PairTransport { tx: out_tx, rx: in_rx, closed: false },
        RemoteEnd { outbound_rx: out_rx, inbound_tx: in_tx },
    )
}

impl AgentTransport for PairTransport {
    fn send(&mut self, frame: OutboundFrame) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed {
                return Err(AppError::LinkLost("pair transport closed".into()));
            }
            self.tx
                .send(frame)
                .map_err(|_| AppError::LinkLost("remote end dropped".into()))
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<InboundFrame>>> {
        Box::pin(async move {
            if self.closed {
                return Ok(None);
            }
            Ok(self.rx.recv().await)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed = true;
        })
    }
}
