//! Shared fixtures for integration tests: a scripted transport factory,
//! a recording channel adapter, and a full core stack on a temp data dir.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify, Semaphore};

use happyd::agent::transport::{
    pair, AgentTransport, BoxFuture, RemoteEnd, TransportFactory,
};
use happyd::agent::wire::{InboundFrame, OutboundFrame};
use happyd::bridge::adapter::{ChannelAdapter, ChannelMessage};
use happyd::bridge::{ChannelBridge, SwitchGate};
use happyd::bus::EventBus;
use happyd::config::GlobalConfig;
use happyd::events::EventStatus;
use happyd::ledger::MessageLedger;
use happyd::permissions::PermissionBroker;
use happyd::router::SessionRouter;
use happyd::settings::{MachineIdentity, SettingsStore};
use happyd::{AppError, Result};

// ── Scripted transport factory ───────────────────────────────────────────────

/// Factory producing in-process transport pairs. Each successful connect
/// consumes one gate permit, pre-sends the `hello` ack, and hands the
/// remote end to the test through a channel.
pub struct ScriptedFactory {
    remotes_tx: mpsc::UnboundedSender<RemoteEnd>,
    gate: Semaphore,
    connects: AtomicU64,
}

impl ScriptedFactory {
    /// Factory with effectively unlimited connects.
    pub fn unlimited() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::with_permits(1_000)
    }

    /// Factory allowing only `permits` connects until more are granted.
    pub fn with_permits(permits: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                remotes_tx,
                gate: Semaphore::new(permits),
                connects: AtomicU64::new(0),
            }),
            remotes_rx,
        )
    }

    /// Grant additional connect permits.
    pub fn allow_connects(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Total successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl TransportFactory for ScriptedFactory {
    fn connect(&self, _session_name: &str) -> BoxFuture<'_, Result<Box<dyn AgentTransport>>> {
        Box::pin(async move {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| AppError::NetworkUnavailable("factory closed".into()))?;
            permit.forget();

            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            let (transport, remote) = pair();
            // Ack the handshake up front so connects complete without the
            // test having to race the session worker.
            let _ = remote
                .inbound_tx
                .send(InboundFrame::Hello { session_id: format!("sess-{n}"), current_dir: None });
            let _ = self.remotes_tx.send(remote);
            Ok(Box::new(transport) as Box<dyn AgentTransport>)
        })
    }
}

// ── Remote-side scripting helpers ────────────────────────────────────────────

/// Read outbound frames until the next `user_message`, returning its turn
/// and metadata. Panics after `timeout`.
pub async fn expect_user_message(remote: &mut RemoteEnd) -> (u64, String, serde_json::Value) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout_at(deadline, remote.outbound_rx.recv())
            .await
            .expect("user_message before timeout")
            .expect("outbound stream open");
        match frame {
            OutboundFrame::UserMessage { turn, text, metadata } => return (turn, text, metadata),
            OutboundFrame::Hello { .. } | OutboundFrame::Ping => {}
            other => panic!("unexpected outbound frame {other:?}"),
        }
    }
}

/// Push an assistant text fragment.
pub fn send_text(remote: &RemoteEnd, turn: u64, content: &str, is_final: bool) {
    let _ = remote.inbound_tx.send(InboundFrame::Text {
        turn,
        content: content.into(),
        is_final,
    });
}

/// Push the turn-boundary status transition.
pub fn send_ready(remote: &RemoteEnd, turn: u64, request_id: Option<String>) {
    let _ = remote.inbound_tx.send(InboundFrame::Status {
        turn,
        from: EventStatus::Processing,
        to: EventStatus::Ready,
        request_id,
    });
}

// ── Recording adapter ────────────────────────────────────────────────────────

/// One call captured by the recording adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Send { to: String, text: String },
    Reply { reply_to: String, text: String },
    Typing { to: String },
}

/// Adapter that records every call for assertions.
pub struct RecordingAdapter {
    channel_id: String,
    calls: Mutex<Vec<AdapterCall>>,
    notify: Notify,
}

impl RecordingAdapter {
    pub fn new(channel_id: &str) -> Arc<Self> {
        Arc::new(Self {
            channel_id: channel_id.to_owned(),
            calls: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    /// All recorded calls so far.
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Recorded sends and replies (typing excluded).
    pub fn messages(&self) -> Vec<AdapterCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, AdapterCall::Typing { .. }))
            .collect()
    }

    /// Await until at least `n` non-typing calls have been recorded.
    pub async fn wait_for_messages(&self, n: usize) -> Vec<AdapterCall> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let messages = self.messages();
            if messages.len() >= n {
                return messages;
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!("expected {n} adapter messages, have {:?}", self.messages());
            }
        }
    }

    fn record(&self, call: AdapterCall) {
        self.calls.lock().expect("calls lock").push(call);
        self.notify.notify_waiters();
    }
}

impl ChannelAdapter for RecordingAdapter {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn send_text<'a>(&'a self, to: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(AdapterCall::Send { to: to.into(), text: text.into() });
            Ok(())
        })
    }

    fn reply_text<'a>(&'a self, reply_to_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(AdapterCall::Reply { reply_to: reply_to_id.into(), text: text.into() });
            Ok(())
        })
    }

    fn send_typing<'a>(&'a self, to: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(AdapterCall::Typing { to: to.into() });
            Ok(())
        })
    }
}

// ── Full core stack ──────────────────────────────────────────────────────────

/// The assembled core on a temp data dir with a scripted agent.
pub struct Stack {
    pub config: Arc<GlobalConfig>,
    pub ledger: Arc<MessageLedger>,
    pub bus: Arc<EventBus>,
    pub permissions: Arc<PermissionBroker>,
    pub router: Arc<SessionRouter>,
    pub bridge: Arc<ChannelBridge>,
    pub factory: Arc<ScriptedFactory>,
    pub remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    _bridge_task: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

/// Build the stack, letting the test tweak config and factory permits.
pub fn build_stack(permits: usize, mutate: impl FnOnce(&mut GlobalConfig)) -> Stack {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = GlobalConfig::default();
    config.data_dir = dir.path().to_string_lossy().into_owned();
    config.default_workspace = dir.path().join("workspace").to_string_lossy().into_owned();
    config.ledger.persist_shards = false;
    // Keep reconnects fast for tests.
    config.agent.reconnect_base_seconds = 1;
    config.agent.reconnect_cap_seconds = 1;
    mutate(&mut config);
    let config = Arc::new(config);

    let identity = MachineIdentity {
        hostname: "test-host".into(),
        home: "/home/tester".into(),
        platform: "linux".into(),
        arch: "x86_64".into(),
        user: "tester".into(),
    };
    let settings = Arc::new(SettingsStore::without_keyring(dir.path().to_path_buf(), &identity));

    let ledger = Arc::new(MessageLedger::new(config.ledger.clone()));
    let bus = EventBus::new(Arc::clone(&ledger), config.bus.queue_capacity);
    let permissions = Arc::new(PermissionBroker::new());
    let (factory, remotes) = ScriptedFactory::with_permits(permits);
    let gate = SwitchGate::new(config.bridge.switch_buffer_cap);

    let router = SessionRouter::new(
        Arc::clone(&config),
        settings,
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
        Arc::clone(&bus),
        Arc::clone(&permissions),
        gate,
    );
    let bridge = ChannelBridge::new(Arc::clone(&config), Arc::clone(&router), Arc::clone(&bus));
    let bridge_task = bridge.start();

    Stack {
        config,
        ledger,
        bus,
        permissions,
        router,
        bridge,
        factory,
        remotes,
        _bridge_task: bridge_task,
        _dir: dir,
    }
}

/// A plain inbound message for a channel.
pub fn inbound(channel: &str, message_id: &str, text: &str) -> ChannelMessage {
    ChannelMessage {
        channel_id: channel.into(),
        session_key: "dm:u1".into(),
        message_id: message_id.into(),
        sender_id: "u1".into(),
        text: text.into(),
        reply_to_id: None,
        metadata: serde_json::Value::Null,
    }
}
