//! Per-session agent link worker.
//!
//! One worker task owns each live session's link state; every mutation
//! arrives as a command on a bounded mailbox. The worker decodes wire
//! frames into [`AgentEvent`]s, filters remote retries by fingerprint
//! *before* assigning the per-session sequence number, assembles streaming
//! tool-call input, watches link liveness, and reconnects with jittered
//! exponential backoff. Sequence numbers are a local property: they
//! continue across reconnects, and fingerprint de-duplication absorbs
//! whatever the remote replays from its own checkpoint.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::transport::{AgentTransport, TransportFactory};
use crate::agent::wire::{InboundFrame, OutboundFrame};
use crate::config::AgentConfig;
use crate::events::{
    fingerprint, AgentEvent, EventStatus, PermissionMode, SessionEvent, ToolCallState,
};
use crate::permissions::PromptDecision;
use crate::{AppError, Result};

/// Recent-fingerprint window bounding the de-duplication memory.
const DEDUP_WINDOW: usize = 4096;
/// Command mailbox depth per session worker.
const MAILBOX_CAPACITY: usize = 64;

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// No link and none being established.
    Unconnected,
    /// Link establishment or reconnect in progress.
    Connecting,
    /// Link live.
    Connected,
    /// Orderly teardown in progress.
    Disconnecting,
}

/// Latest usage accounting numbers.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Tokens served from prompt cache.
    pub cache_read_tokens: u64,
    /// Context window occupancy.
    pub context_size: u64,
}

/// Point-in-time view of a session for status surfaces.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Stable session name.
    pub session_name: String,
    /// Agent-issued session id.
    pub session_id: String,
    /// Workspace directory.
    pub workspace: PathBuf,
    /// Permission mode.
    pub permission_mode: PermissionMode,
    /// Link lifecycle state.
    pub lifecycle: Lifecycle,
    /// Agent activity status.
    pub status: EventStatus,
    /// Latest usage numbers, if any arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
}

/// Connection parameters for a session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Stable session name.
    pub session_name: String,
    /// Workspace directory (absolute).
    pub workspace: PathBuf,
    /// Permission mode for the session.
    pub permission_mode: PermissionMode,
}

enum SessionCommand {
    SendUserMessage {
        text: String,
        metadata: serde_json::Value,
        reply: oneshot::Sender<Result<String>>,
    },
    ResolvePermission {
        prompt_id: String,
        decision: PromptDecision,
        mode: Option<PermissionMode>,
        allowed_tools: Option<Vec<String>>,
        reply: oneshot::Sender<Result<()>>,
    },
    Abort {
        request_id: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a live session worker. Cloneable; all methods are mailbox
/// round-trips into the owning worker.
#[derive(Clone)]
pub struct AgentSessionHandle {
    session_name: String,
    session_id: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl AgentSessionHandle {
    /// Stable session name.
    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Agent-issued session id (from the initial handshake).
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current snapshot for status surfaces.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Enqueue a user message; returns the request id used for reply
    /// correlation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotConnected` if the worker is gone or the link
    /// is not live.
    pub async fn send_user_message(
        &self,
        text: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::SendUserMessage { text: text.into(), metadata, reply })
            .await
            .map_err(|_| AppError::NotConnected("session worker stopped".into()))?;
        rx.await.map_err(|_| AppError::NotConnected("session worker stopped".into()))?
    }

    /// Forward a permission decision to the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotConnected` if the worker is gone.
    pub async fn resolve_permission(
        &self,
        prompt_id: impl Into<String>,
        decision: PromptDecision,
        mode: Option<PermissionMode>,
        allowed_tools: Option<Vec<String>>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::ResolvePermission {
                prompt_id: prompt_id.into(),
                decision,
                mode,
                allowed_tools,
                reply,
            })
            .await
            .map_err(|_| AppError::NotConnected("session worker stopped".into()))?;
        rx.await.map_err(|_| AppError::NotConnected("session worker stopped".into()))?
    }

    /// Cancel the current in-flight turn (or the one owning `request_id`).
    /// Idempotent: succeeds even if the turn already completed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotConnected` if the worker is gone.
    pub async fn abort(&self, request_id: Option<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Abort { request_id, reply })
            .await
            .map_err(|_| AppError::NotConnected("session worker stopped".into()))?;
        rx.await.map_err(|_| AppError::NotConnected("session worker stopped".into()))?
    }

    /// Tear the link down; safe to call in any state.
    ///
    /// # Errors
    ///
    /// Never fails in practice; a stopped worker is already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Disconnect { reply }).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Whether the worker task is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Hard-stop the worker without the Bye exchange. Used when an orderly
    /// disconnect cannot be awaited (process shutdown).
    pub fn force_stop(&self) {
        self.cancel.cancel();
    }
}

/// Establish the link and spawn the session worker.
///
/// Performs the hello handshake synchronously so the caller gets the
/// agent-issued session id (or a typed failure) before any event flows.
///
/// # Errors
///
/// - `AppError::CredentialsMissing` / `CredentialsInvalid` — fatal.
/// - `AppError::NetworkUnavailable` — the child/backend is unreachable.
/// - `AppError::ServerRejected` — the backend refused the handshake.
pub async fn connect(
    params: ConnectParams,
    factory: Arc<dyn TransportFactory>,
    config: AgentConfig,
    event_tx: mpsc::Sender<SessionEvent>,
) -> Result<AgentSessionHandle> {
    let mut transport = factory.connect(&params.session_name).await?;
    let handshake_timeout = Duration::from_secs(config.liveness_seconds);
    let session_id =
        match handshake(transport.as_mut(), &params, None, handshake_timeout).await {
            Ok(id) => id,
            Err(err) => {
                transport.close().await;
                return Err(err);
            }
        };

    info!(session_name = %params.session_name, %session_id, "agent session connected");

    let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let cancel = CancellationToken::new();
    let snapshot = SessionSnapshot {
        session_name: params.session_name.clone(),
        session_id: session_id.clone(),
        workspace: params.workspace.clone(),
        permission_mode: params.permission_mode,
        lifecycle: Lifecycle::Connected,
        status: EventStatus::Idle,
        usage: None,
    };
    let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);

    let worker = Worker {
        params,
        session_id: session_id.clone(),
        transport,
        factory,
        config,
        event_tx,
        snapshot_tx,
        cancel: cancel.clone(),
        seq: 0,
        seen: HashSet::new(),
        seen_order: VecDeque::new(),
        turn: 0,
        requests: HashMap::new(),
        completed_turns: HashSet::new(),
        aborted_turns: HashSet::new(),
        tools: HashMap::new(),
        status: EventStatus::Idle,
        usage: None,
        last_rx: Instant::now(),
    };
    tokio::spawn(worker.run(cmd_rx));

    Ok(AgentSessionHandle {
        session_name: snapshot_name(&snapshot_rx),
        session_id,
        cmd_tx,
        cancel,
        snapshot_rx,
    })
}

fn snapshot_name(rx: &watch::Receiver<SessionSnapshot>) -> String {
    rx.borrow().session_name.clone()
}

async fn handshake(
    transport: &mut dyn AgentTransport,
    params: &ConnectParams,
    resume: Option<String>,
    timeout: Duration,
) -> Result<String> {
    transport
        .send(OutboundFrame::Hello {
            session_name: params.session_name.clone(),
            workspace: params.workspace.to_string_lossy().into_owned(),
            permission_mode: params.permission_mode,
            resume,
        })
        .await?;

    let deadline = Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, transport.recv())
            .await
            .map_err(|_| AppError::NetworkUnavailable("handshake timed out".into()))??;
        match frame {
            Some(InboundFrame::Hello { session_id, .. }) => return Ok(session_id),
            Some(InboundFrame::Error { kind, message, .. }) => {
                return Err(match kind.as_str() {
                    "CredentialsMissing" => AppError::CredentialsMissing(message),
                    "CredentialsInvalid" => AppError::CredentialsInvalid(message),
                    _ => AppError::ServerRejected(format!("{kind}: {message}")),
                });
            }
            Some(other) => {
                debug!(?other, "ignoring pre-handshake frame");
            }
            None => {
                return Err(AppError::NetworkUnavailable(
                    "stream closed during handshake".into(),
                ));
            }
        }
    }
}

struct Worker {
    params: ConnectParams,
    session_id: String,
    transport: Box<dyn AgentTransport>,
    factory: Arc<dyn TransportFactory>,
    config: AgentConfig,
    event_tx: mpsc::Sender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
    seq: u64,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    turn: u64,
    requests: HashMap<String, u64>,
    completed_turns: HashSet<u64>,
    aborted_turns: HashSet<u64>,
    tools: HashMap<String, ToolBuilder>,
    status: EventStatus,
    usage: Option<UsageSnapshot>,
    last_rx: Instant,
}

struct ToolBuilder {
    name: String,
    input: serde_json::Value,
    state: Option<ToolCallState>,
    started_at: DateTime<Utc>,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
        let liveness = Duration::from_secs(self.config.liveness_seconds);
        let mut ticker = tokio::time::interval(liveness / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.transport.close().await;
                    break;
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => {
                            self.transport.close().await;
                            break;
                        }
                        Some(SessionCommand::Disconnect { reply }) => {
                            self.set_lifecycle(Lifecycle::Disconnecting);
                            let _ = self.transport.send(OutboundFrame::Bye).await;
                            self.transport.close().await;
                            let _ = reply.send(Ok(()));
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                frame = self.transport.recv() => {
                    match frame {
                        Ok(Some(frame)) => {
                            self.last_rx = Instant::now();
                            self.handle_frame(frame).await;
                        }
                        Ok(None) => {
                            if !self.lost_link_and_reconnect("stream closed").await {
                                break;
                            }
                        }
                        Err(err) => {
                            if !self.lost_link_and_reconnect(err.message()).await {
                                break;
                            }
                        }
                    }
                }

                _ = ticker.tick() => {
                    if self.last_rx.elapsed() > liveness {
                        if !self.lost_link_and_reconnect("liveness threshold exceeded").await {
                            break;
                        }
                    } else {
                        let _ = self.transport.send(OutboundFrame::Ping).await;
                    }
                }
            }
        }

        self.set_lifecycle(Lifecycle::Unconnected);
        debug!(session_name = %self.params.session_name, "session worker stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SendUserMessage { text, metadata, reply } => {
                self.turn += 1;
                let mut metadata = match metadata {
                    serde_json::Value::Object(map) => map,
                    serde_json::Value::Null => serde_json::Map::new(),
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("caller".into(), other);
                        map
                    }
                };
                // Callers (the bridge) may pre-assign the correlation id so
                // their pending record exists before the first frame lands.
                let request_id = metadata
                    .get("request_id")
                    .and_then(serde_json::Value::as_str)
                    .map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned);
                metadata
                    .insert("request_id".into(), serde_json::Value::String(request_id.clone()));
                self.requests.insert(request_id.clone(), self.turn);

                let result = self
                    .transport
                    .send(OutboundFrame::UserMessage {
                        turn: self.turn,
                        text,
                        metadata: serde_json::Value::Object(metadata),
                    })
                    .await
                    .map(|()| request_id);
                if result.is_ok() {
                    self.status = EventStatus::Processing;
                    self.publish_snapshot();
                }
                let _ = reply.send(result);
            }
            SessionCommand::ResolvePermission { prompt_id, decision, mode, allowed_tools, reply } => {
                let decision_str = match decision {
                    PromptDecision::Allow => "allow",
                    PromptDecision::Deny => "deny",
                };
                let result = self
                    .transport
                    .send(OutboundFrame::PermissionDecision {
                        prompt_id,
                        decision: decision_str.into(),
                        mode,
                        allowed_tools,
                    })
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::Abort { request_id, reply } => {
                let turn = request_id
                    .as_deref()
                    .and_then(|rid| self.requests.get(rid).copied())
                    .unwrap_or(self.turn);
                if turn == 0 || self.completed_turns.contains(&turn) {
                    // Turn already over; abort is a no-op by contract.
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.aborted_turns.insert(turn);
                let _ = self.transport.send(OutboundFrame::Abort { turn: Some(turn) }).await;

                let echoed = request_id.or_else(|| {
                    self.requests
                        .iter()
                        .find(|(_, t)| **t == turn)
                        .map(|(rid, _)| rid.clone())
                });
                let from = self.status;
                self.mark_turn_complete(turn);
                self.emit(
                    turn,
                    AgentEvent::StatusChange {
                        from,
                        to: EventStatus::Ready,
                        reason: Some("aborted".into()),
                        request_id: echoed,
                    },
                )
                .await;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Disconnect { .. } => {
                // Handled in the select loop before dispatch.
            }
        }
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Hello { session_id, .. } => {
                if session_id != self.session_id {
                    warn!(
                        old = %self.session_id,
                        new = %session_id,
                        "remote issued a new session id on reconnect; sequence continues locally"
                    );
                }
            }
            InboundFrame::Text { turn, content, is_final } => {
                if self.aborted_turns.contains(&turn) {
                    debug!(turn, "dropping fragment for aborted turn");
                    return;
                }
                self.emit(turn, AgentEvent::AssistantText { content, is_final }).await;
            }
            InboundFrame::ToolInput { turn: _, tool_id, name, input } => {
                let builder = self.tools.entry(tool_id).or_insert_with(|| ToolBuilder {
                    name: name.clone(),
                    input: serde_json::Value::Null,
                    state: None,
                    started_at: Utc::now(),
                });
                builder.name = name;
                builder.input = input;
            }
            InboundFrame::ToolState { turn, tool_id, name, state, result, error } => {
                let builder = self.tools.entry(tool_id.clone()).or_insert_with(|| ToolBuilder {
                    name: name.clone().unwrap_or_else(|| "unknown".into()),
                    input: serde_json::Value::Null,
                    state: None,
                    started_at: Utc::now(),
                });
                if let Some(name) = name {
                    builder.name = name;
                }
                if let Some(current) = builder.state {
                    if state.rank() < current.rank() {
                        debug!(%tool_id, ?state, ?current, "dropping tool state regression");
                        return;
                    }
                }
                builder.state = Some(state);
                let terminal =
                    matches!(state, ToolCallState::Succeeded | ToolCallState::Failed);
                let event = AgentEvent::ToolCall {
                    tool_id,
                    name: builder.name.clone(),
                    input: builder.input.clone(),
                    state,
                    started_at: builder.started_at,
                    finished_at: terminal.then(Utc::now),
                    result,
                    error,
                };
                self.emit(turn, event).await;
            }
            InboundFrame::Permission { turn, prompt_id, tool_name, input, proposed_mode } => {
                self.emit(
                    turn,
                    AgentEvent::PermissionPrompt { prompt_id, tool_name, input, proposed_mode },
                )
                .await;
            }
            InboundFrame::Usage {
                input_tokens,
                output_tokens,
                cache_read_tokens,
                context_size,
            } => {
                self.usage = Some(UsageSnapshot {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    context_size,
                });
                self.emit(
                    self.turn,
                    AgentEvent::UsageUpdate {
                        input_tokens,
                        output_tokens,
                        cache_read_tokens,
                        context_size,
                    },
                )
                .await;
            }
            InboundFrame::Status { turn, from, to, request_id } => {
                if self.completed_turns.contains(&turn) {
                    debug!(turn, "dropping status for completed turn");
                    return;
                }
                if to == EventStatus::Ready {
                    self.mark_turn_complete(turn);
                }
                self.emit(turn, AgentEvent::StatusChange { from, to, reason: None, request_id })
                    .await;
            }
            InboundFrame::Error { kind, message, retriable } => {
                self.emit(self.turn, AgentEvent::Error { kind, message, retriable }).await;
            }
            InboundFrame::Pong => {}
        }
    }

    fn mark_turn_complete(&mut self, turn: u64) {
        self.completed_turns.insert(turn);
        self.tools.clear();
        self.requests.retain(|_, t| !self.completed_turns.contains(t));
        // Completed-turn memory stays small: turn numbers only grow.
        let floor = self.turn.saturating_sub(64);
        self.completed_turns.retain(|t| *t >= floor);
        self.aborted_turns.retain(|t| *t + 64 >= self.turn);
    }

    async fn emit(&mut self, turn: u64, event: AgentEvent) {
        let fp = fingerprint(turn, &event);
        if self.seen.contains(&fp) {
            debug!(fingerprint = %fp, "dropping duplicate event");
            return;
        }
        self.seen.insert(fp.clone());
        self.seen_order.push_back(fp.clone());
        while self.seen_order.len() > DEDUP_WINDOW {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }

        if let AgentEvent::StatusChange { to, .. } = &event {
            self.status = *to;
        }
        self.publish_snapshot();

        self.seq += 1;
        let sequenced = SessionEvent {
            session_id: self.session_id.clone(),
            seq: self.seq,
            at: Utc::now(),
            fingerprint: fp,
            event,
        };
        if self.event_tx.send(sequenced).await.is_err() {
            debug!("event consumer dropped; cancelling session worker");
            self.cancel.cancel();
        }
    }

    /// Emit the link-lost error and run the reconnect loop.
    ///
    /// Returns `true` when the link was restored, `false` when the worker
    /// should stop (cancelled, credentials, or attempts exhausted).
    async fn lost_link_and_reconnect(&mut self, why: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        warn!(session_name = %self.params.session_name, why, "agent link lost");
        self.set_lifecycle(Lifecycle::Connecting);
        self.emit(
            self.turn,
            AgentEvent::Error {
                kind: "LinkLost".into(),
                message: format!("agent link lost: {why}"),
                retriable: true,
            },
        )
        .await;

        match self.reconnect().await {
            Ok(()) => {
                self.set_lifecycle(Lifecycle::Connected);
                true
            }
            Err(err) => {
                self.emit(
                    self.turn,
                    AgentEvent::Error {
                        kind: err.kind().into(),
                        message: err.message().to_owned(),
                        retriable: false,
                    },
                )
                .await;
                false
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let base = Duration::from_secs(self.config.reconnect_base_seconds.max(1));
        let cap = Duration::from_secs(self.config.reconnect_cap_seconds);
        let timeout = Duration::from_secs(self.config.liveness_seconds);

        for attempt in 1..=self.config.reconnect_attempts {
            let exp = base.saturating_mul(1_u32 << (attempt - 1).min(16));
            let delay = exp.min(cap);
            let jitter_ms = rand::rng().random_range(0..=delay.as_millis().max(1) / 2);
            let wait = delay + Duration::from_millis(u64::try_from(jitter_ms).unwrap_or(0));

            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(AppError::LinkLost("cancelled during reconnect".into()));
                }
                () = tokio::time::sleep(wait) => {}
            }

            match self.factory.connect(&self.params.session_name).await {
                Ok(mut transport) => {
                    match handshake(
                        transport.as_mut(),
                        &self.params,
                        Some(self.session_id.clone()),
                        timeout,
                    )
                    .await
                    {
                        Ok(new_id) => {
                            if new_id != self.session_id {
                                debug!(old = %self.session_id, new = %new_id,
                                    "session id changed on reconnect");
                            }
                            info!(
                                session_name = %self.params.session_name,
                                attempt, "agent link restored"
                            );
                            self.transport = transport;
                            self.last_rx = Instant::now();
                            return Ok(());
                        }
                        Err(err) if err.retriable() => {
                            warn!(attempt, %err, "reconnect handshake failed");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) if err.retriable() => {
                    warn!(attempt, %err, "reconnect attempt failed");
                }
                Err(err) => return Err(err),
            }
        }

        Err(AppError::ReconnectExhausted(format!(
            "gave up after {} attempts",
            self.config.reconnect_attempts
        )))
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.snapshot_tx.send_modify(|snap| snap.lifecycle = lifecycle);
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_modify(|snap| {
            snap.status = self.status;
            snap.usage = self.usage;
        });
    }
}
