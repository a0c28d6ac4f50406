//! Session routing: name → live agent link, current-session selection,
//! and the serialized hot workspace switch.
//!
//! The router owns the set of sessions. Each live session gets a pump task
//! that is the sole writer of that session's ledger cursor: it drains the
//! session worker's event channel, registers permission prompts with the
//! broker, and pushes every event through the ledger-plus-bus publish
//! step. At most one live agent link exists per session name; concurrent
//! `connect` callers are serialized on a per-name establishment lock and
//! observe the same handle. The session map itself is only ever locked
//! for short lookups and inserts — never across a dial or handshake — so
//! status reads stay responsive while a connect or switch is in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::session::{self, AgentSessionHandle, ConnectParams, SessionSnapshot};
use crate::agent::transport::TransportFactory;
use crate::bridge::SwitchGate;
use crate::bus::{BusEvent, EventBus};
use crate::config::GlobalConfig;
use crate::events::{AgentEvent, PermissionMode, SessionEvent};
use crate::permissions::{PermissionBroker, PromptRecord, PromptResolution};
use crate::settings::SettingsStore;
use crate::{AppError, Result};

/// Session name used when no explicit name is given.
pub const DEFAULT_SESSION: &str = "main";

/// Event-channel depth between a session worker and its pump.
const PUMP_CHANNEL_CAPACITY: usize = 256;

struct SessionEntry {
    handle: AgentSessionHandle,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct RouterInner {
    sessions: HashMap<String, SessionEntry>,
    current: Option<String>,
}

/// Name→session resolution and lifecycle transitions.
pub struct SessionRouter {
    config: Arc<GlobalConfig>,
    settings: Arc<SettingsStore>,
    factory: Arc<dyn TransportFactory>,
    bus: Arc<EventBus>,
    permissions: Arc<PermissionBroker>,
    gate: Arc<SwitchGate>,
    /// Session map; locked briefly, never across link establishment.
    inner: Mutex<RouterInner>,
    /// Per-name establishment locks: the link for a name is dialed at
    /// most once at a time, without wedging the map.
    name_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes `switch_workspace`; held for the whole transition.
    switch_lock: Mutex<()>,
}

impl SessionRouter {
    /// Create a router.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        settings: Arc<SettingsStore>,
        factory: Arc<dyn TransportFactory>,
        bus: Arc<EventBus>,
        permissions: Arc<PermissionBroker>,
        gate: Arc<SwitchGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            settings,
            factory,
            bus,
            permissions,
            gate,
            inner: Mutex::new(RouterInner::default()),
            name_locks: std::sync::Mutex::new(HashMap::new()),
            switch_lock: Mutex::new(()),
        })
    }

    /// The switch gate shared with the channel bridge.
    #[must_use]
    pub fn gate(&self) -> Arc<SwitchGate> {
        Arc::clone(&self.gate)
    }

    /// Connect (or return) the session with the given name and make it
    /// current.
    ///
    /// # Errors
    ///
    /// Propagates [`session::connect`] failures (credentials, network,
    /// server rejection).
    pub async fn connect(&self, session_name: &str) -> Result<AgentSessionHandle> {
        let establishing = self.name_lock(session_name);
        let _serial = establishing.lock().await;

        {
            let mut inner = self.inner.lock().await;
            let alive_handle = inner
                .sessions
                .get(session_name)
                .filter(|entry| entry.handle.is_alive())
                .map(|entry| entry.handle.clone());
            if let Some(handle) = alive_handle {
                inner.current = Some(session_name.to_owned());
                return Ok(handle);
            }
        }

        let workspace = self.resolve_workspace();
        self.establish(session_name, workspace, PermissionMode::default()).await
    }

    /// The currently selected session, if it is alive.
    pub async fn current(&self) -> Option<AgentSessionHandle> {
        let inner = self.inner.lock().await;
        let name = inner.current.as_deref()?;
        inner
            .sessions
            .get(name)
            .filter(|entry| entry.handle.is_alive())
            .map(|entry| entry.handle.clone())
    }

    /// The current session, connecting the default one when none exists.
    ///
    /// # Errors
    ///
    /// Propagates connect failures.
    pub async fn ensure_current(&self) -> Result<AgentSessionHandle> {
        if let Some(handle) = self.current().await {
            return Ok(handle);
        }
        self.connect(DEFAULT_SESSION).await
    }

    /// Look up a session by name.
    pub async fn session(&self, session_name: &str) -> Option<AgentSessionHandle> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(session_name)
            .filter(|entry| entry.handle.is_alive())
            .map(|entry| entry.handle.clone())
    }

    /// Resolve a session handle by agent-issued session id.
    pub async fn session_by_id(&self, session_id: &str) -> Option<AgentSessionHandle> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .values()
            .find(|entry| entry.handle.session_id() == session_id && entry.handle.is_alive())
            .map(|entry| entry.handle.clone())
    }

    /// Snapshots of every known session.
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock().await;
        inner.sessions.values().map(|entry| entry.handle.snapshot()).collect()
    }

    /// Atomically move the current session to a new workspace directory.
    ///
    /// Serialized: overlapping callers observe a single transition. While
    /// the switch runs, inbound channel messages buffer at the bridge's
    /// switch gate; the gate reopens before the outcome event is published
    /// so drained messages route against the new session.
    ///
    /// # Errors
    ///
    /// - `AppError::DirectoryNotCreatable` — the target cannot be created.
    /// - `AppError::AgentStartFailed` and connect-class errors — the new
    ///   link could not be established.
    pub async fn switch_workspace(&self, new_path: &Path) -> Result<AgentSessionHandle> {
        let _serial = self.switch_lock.lock().await;
        self.gate.begin();

        let result = self
            .switch_workspace_inner(new_path)
            .instrument(info_span!("switch_workspace", path = %new_path.display()))
            .await;

        self.gate.end();
        match result {
            Ok(handle) => {
                self.bus.publish_infra(BusEvent::WorkspaceSwitched {
                    session_name: handle.session_name().to_owned(),
                    path: new_path.to_string_lossy().into_owned(),
                });
                Ok(handle)
            }
            Err(err) => {
                self.bus.publish_infra(BusEvent::SwitchFailed {
                    session_name: self
                        .inner
                        .lock()
                        .await
                        .current
                        .clone()
                        .unwrap_or_else(|| DEFAULT_SESSION.to_owned()),
                    kind: err.kind().to_owned(),
                    message: err.message().to_owned(),
                });
                Err(err)
            }
        }
    }

    async fn switch_workspace_inner(&self, new_path: &Path) -> Result<AgentSessionHandle> {
        std::fs::create_dir_all(new_path).map_err(|err| {
            AppError::DirectoryNotCreatable(format!("{}: {err}", new_path.display()))
        })?;

        let session_name = {
            let inner = self.inner.lock().await;
            inner.current.clone().unwrap_or_else(|| DEFAULT_SESSION.to_owned())
        };
        let establishing = self.name_lock(&session_name);
        let _serial = establishing.lock().await;

        let old = {
            let mut inner = self.inner.lock().await;
            inner.sessions.remove(&session_name)
        };
        let permission_mode = old
            .as_ref()
            .map_or_else(PermissionMode::default, |e| e.handle.snapshot().permission_mode);
        if let Some(entry) = old {
            info!(%session_name, "stopping session for workspace switch");
            let _ = entry.handle.disconnect().await;
        }

        // Persist the override so restarts land in the same place.
        if let Ok(mut settings) = self.settings.load_settings() {
            settings.workspace_override = Some(new_path.to_string_lossy().into_owned());
            let _ = self.settings.save_settings(&settings);
        }

        // Session identity (the name) survives; the agent may issue a new
        // session id for the new link.
        self.establish(&session_name, new_path.to_path_buf(), permission_mode).await
    }

    /// Drop and re-establish the current session's link (same name, same
    /// workspace). Used after credential rotation.
    ///
    /// # Errors
    ///
    /// Propagates connect failures.
    pub async fn reconnect_current(&self) -> Result<AgentSessionHandle> {
        let session_name = {
            let inner = self.inner.lock().await;
            inner.current.clone().unwrap_or_else(|| DEFAULT_SESSION.to_owned())
        };
        let establishing = self.name_lock(&session_name);
        let _serial = establishing.lock().await;

        let old = {
            let mut inner = self.inner.lock().await;
            inner.sessions.remove(&session_name)
        };
        let (workspace, permission_mode) = old.as_ref().map_or_else(
            || (self.resolve_workspace(), PermissionMode::default()),
            |e| {
                let snap = e.handle.snapshot();
                (snap.workspace, snap.permission_mode)
            },
        );
        if let Some(entry) = old {
            let _ = entry.handle.disconnect().await;
        }
        self.establish(&session_name, workspace, permission_mode).await
    }

    /// Disconnect one session by name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownSession` if no such session exists.
    pub async fn disconnect(&self, session_name: &str) -> Result<()> {
        let entry = {
            let mut inner = self.inner.lock().await;
            if inner.current.as_deref() == Some(session_name) {
                inner.current = None;
            }
            inner
                .sessions
                .remove(session_name)
                .ok_or_else(|| AppError::UnknownSession(format!("no session '{session_name}'")))?
        };
        let _ = entry.handle.disconnect().await;
        Ok(())
    }

    /// Disconnect every session.
    pub async fn disconnect_all(&self) {
        let entries: Vec<SessionEntry> = {
            let mut inner = self.inner.lock().await;
            inner.current = None;
            inner.sessions.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            let _ = entry.handle.disconnect().await;
        }
    }

    fn resolve_workspace(&self) -> PathBuf {
        self.settings
            .load_settings()
            .ok()
            .and_then(|s| s.workspace_override)
            .map_or_else(|| self.config.workspace(), PathBuf::from)
    }

    fn name_lock(&self, session_name: &str) -> Arc<Mutex<()>> {
        let mut locks = lock_unpoisoned(&self.name_locks);
        Arc::clone(locks.entry(session_name.to_owned()).or_default())
    }

    /// Dial the link and register the session. The caller must hold the
    /// name's establishment lock; the session map is only taken for the
    /// final insert.
    async fn establish(
        &self,
        session_name: &str,
        workspace: PathBuf,
        permission_mode: PermissionMode,
    ) -> Result<AgentSessionHandle> {
        let (event_tx, event_rx) = mpsc::channel(PUMP_CHANNEL_CAPACITY);
        let params = ConnectParams {
            session_name: session_name.to_owned(),
            workspace,
            permission_mode,
        };
        let handle = session::connect(
            params,
            Arc::clone(&self.factory),
            self.config.agent.clone(),
            event_tx,
        )
        .await?;

        let pump = spawn_event_pump(
            handle.clone(),
            event_rx,
            Arc::clone(&self.bus),
            Arc::clone(&self.permissions),
        );

        {
            let mut inner = self.inner.lock().await;
            inner.sessions.insert(
                session_name.to_owned(),
                SessionEntry { handle: handle.clone(), pump },
            );
            inner.current = Some(session_name.to_owned());
        }

        self.bus.publish_infra(BusEvent::SessionLifecycle {
            session_name: session_name.to_owned(),
            session_id: Some(handle.session_id().to_owned()),
            connected: true,
        });
        Ok(handle)
    }
}

/// Pump a session worker's events into the ledger+bus, registering
/// permission prompts along the way. The pump is the sole caller of the
/// publish step for its session, which keeps the ledger cursor
/// single-writer.
fn spawn_event_pump(
    handle: AgentSessionHandle,
    mut event_rx: mpsc::Receiver<SessionEvent>,
    bus: Arc<EventBus>,
    permissions: Arc<PermissionBroker>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session_name = handle.session_name().to_owned();
        let session_id = handle.session_id().to_owned();

        while let Some(event) = event_rx.recv().await {
            if let AgentEvent::PermissionPrompt {
                ref prompt_id,
                ref tool_name,
                ref input,
                proposed_mode,
            } = event.event
            {
                let record = PromptRecord {
                    session_id: event.session_id.clone(),
                    prompt_id: prompt_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                    proposed_mode,
                    registered_at: event.at,
                };
                let resolver_handle = handle.clone();
                let resolver_prompt = prompt_id.clone();
                permissions.register(
                    record,
                    Box::new(move |resolution: PromptResolution| {
                        tokio::spawn(async move {
                            if let Err(err) = resolver_handle
                                .resolve_permission(
                                    resolver_prompt,
                                    resolution.decision,
                                    resolution.mode,
                                    resolution.allowed_tools,
                                )
                                .await
                            {
                                warn!(%err, "failed to forward permission decision");
                            }
                        });
                    }),
                );
            }

            bus.publish_session(event);
        }

        // Worker gone: deny whatever prompts are still open for the
        // session and announce the disconnect.
        debug!(%session_name, %session_id, "session event pump draining");
        permissions.deny_session(&session_id);
        bus.publish_infra(BusEvent::SessionLifecycle {
            session_name,
            session_id: Some(session_id),
            connected: false,
        });
    })
}

fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
