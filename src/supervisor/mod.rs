//! Agent child-process lifecycle.
//!
//! The supervisor owns the detached agent child the sessions connect to:
//! it materializes credentials before the first start, waits for the
//! child's ready signal, watches for exits, and applies the crash policy
//! (startup crash ⇒ configuration error; later crash ⇒ one auto-restart;
//! a second crash within the loop window ⇒ auto-restart off, fatal event).
//! All state transitions are mirrored onto the event bus as
//! `daemon:statusChanged` / `daemon:startProgress` infrastructure events.

pub mod credentials;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, DropPolicy, EventBus, SubscriptionFilter};
use crate::config::{GlobalConfig, AGENT_ENV_VARS};
use crate::router::SessionRouter;
use crate::settings::{normalize_server_url, SettingsStore};
use crate::{AppError, Result};

/// Child crashes inside this window after start are configuration errors.
const STARTUP_CRASH_WINDOW: Duration = Duration::from_secs(10);
/// A second crash within this window disables auto-restart.
const CRASH_LOOP_WINDOW: Duration = Duration::from_secs(60);

/// Environment inherited by the child beyond [`AGENT_ENV_VARS`].
const BASE_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Point-in-time child process status.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    /// Whether the child is running.
    pub running: bool,
    /// Child pid when running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Local port the child listens on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Start timestamp of the current child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Exit code of the previous child, when it exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
}

#[derive(serde::Deserialize)]
struct ReadyLine {
    ready: bool,
    port: u16,
    #[serde(default)]
    current_dir: Option<String>,
}

#[derive(Default)]
struct SupState {
    pid: Option<u32>,
    port: Option<u16>,
    started_at: Option<DateTime<Utc>>,
    started_instant: Option<Instant>,
    last_exit_code: Option<i32>,
    last_crash_at: Option<Instant>,
    auto_restart: bool,
    stopping: bool,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Lifecycle owner for the agent child process.
pub struct Supervisor {
    config: Arc<GlobalConfig>,
    settings: Arc<SettingsStore>,
    bus: Arc<EventBus>,
    state: Mutex<SupState>,
    running_tx: watch::Sender<bool>,
    router: OnceLock<Weak<SessionRouter>>,
}

impl Supervisor {
    /// Create a supervisor; the child is not started until
    /// [`ensure_running`](Self::ensure_running).
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        settings: Arc<SettingsStore>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (running_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            settings,
            bus,
            state: Mutex::new(SupState::default()),
            running_tx,
            router: OnceLock::new(),
        })
    }

    /// Wire the router used for post-start workspace consistency and
    /// secret-rotation reconnects. Called once during bootstrap.
    pub fn set_router(&self, router: Weak<SessionRouter>) {
        let _ = self.router.set(router);
    }

    /// Start the child if it is not alive; idempotent.
    ///
    /// # Errors
    ///
    /// - `AppError::CredentialsMissing` — no access key anywhere.
    /// - `AppError::AgentStartFailed` — spawn failure, early exit, or no
    ///   ready signal within the startup window.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<DaemonStatus> {
        let mut state = self.state.lock().await;
        if state.pid.is_some() {
            return Ok(status_of(&state));
        }
        // An explicit start resets the crash-loop breaker.
        state.auto_restart = true;
        state.stopping = false;

        self.progress("credentials", 10);
        credentials::sync_agent_home(&self.config, &self.settings)?;

        self.progress("workspace", 25);
        let workspace = self.resolve_workspace();

        self.progress("spawn", 40);
        let mut child = self.spawn_child(&workspace)?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| {
            AppError::AgentStartFailed("failed to capture agent child stdout".into())
        })?;
        let mut reader = BufReader::new(stdout);

        self.progress("ready-wait", 60);
        let startup = Duration::from_secs(self.config.supervisor.startup_timeout_seconds);
        let mut line = String::new();
        let parsed = match tokio::time::timeout(startup, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => serde_json::from_str::<ReadyLine>(line.trim())
                .map_err(|err| AppError::AgentStartFailed(format!("unparseable ready signal: {err}"))),
            Ok(Ok(_)) => {
                Err(AppError::AgentStartFailed("agent child exited before ready signal".into()))
            }
            Ok(Err(err)) => {
                Err(AppError::AgentStartFailed(format!("failed to read ready signal: {err}")))
            }
            Err(_elapsed) => {
                Err(AppError::AgentStartFailed(format!("no ready signal within {startup:?}")))
            }
        };
        let ready = match parsed {
            Ok(ready) if ready.ready => ready,
            Ok(_) => {
                child.kill().await.ok();
                return Err(AppError::AgentStartFailed("agent child reported not-ready".into()));
            }
            Err(err) => {
                child.kill().await.ok();
                return Err(err);
            }
        };

        let now_wall = Utc::now();
        let now = Instant::now();
        state.pid = pid;
        state.port = Some(ready.port);
        state.started_at = Some(now_wall);
        state.started_instant = Some(now);

        let (kill_tx, kill_rx) = oneshot::channel();
        state.kill_tx = Some(kill_tx);

        // Drain remaining stdout so the child never blocks on a full pipe.
        tokio::spawn(async move {
            let mut buf = String::new();
            while let Ok(n) = reader.read_line(&mut buf).await {
                if n == 0 {
                    break;
                }
                debug!(line = buf.trim(), "agent child stdout");
                buf.clear();
            }
        });

        let monitor_self = Arc::clone(self);
        tokio::spawn(async move {
            let exit_code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx => {
                    child.kill().await.ok();
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            monitor_self.handle_child_exit(exit_code).await;
        });

        let _ = self.running_tx.send(true);
        self.bus
            .publish_infra(BusEvent::DaemonStatusChanged { running: true, pid });
        self.progress("ready", 100);
        info!(?pid, port = ready.port, "agent child running");

        let status = status_of(&state);
        drop(state);
        self.check_workspace_consistency(ready.current_dir.as_deref(), &workspace);
        Ok(status)
    }

    /// Request child shutdown.
    ///
    /// Graceful stops send the polite signal first and escalate after the
    /// configured grace period; non-graceful stops kill immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::GracefulStopTimeout` if the child survives both
    /// the grace period and the escalation window.
    pub async fn stop(&self, graceful: bool) -> Result<()> {
        let grace = Duration::from_secs(self.config.supervisor.grace_seconds);
        let (pid, kill_tx) = {
            let mut state = self.state.lock().await;
            state.stopping = true;
            (state.pid, state.kill_tx.take())
        };
        let Some(pid) = pid else {
            return Ok(());
        };

        let mut running_rx = self.running_tx.subscribe();

        if graceful {
            terminate_politely(pid);
            let waited = tokio::time::timeout(grace, async {
                while *running_rx.borrow_and_update() {
                    if running_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if waited.is_ok() {
                return Ok(());
            }
            warn!(pid, "agent child ignored graceful stop, escalating");
        }

        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while *running_rx.borrow_and_update() {
                if running_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|_| AppError::GracefulStopTimeout(format!("child {pid} survived SIGKILL window")))
    }

    /// Stop then start.
    ///
    /// # Errors
    ///
    /// Propagates [`stop`](Self::stop) and
    /// [`ensure_running`](Self::ensure_running) failures.
    pub async fn restart(self: &Arc<Self>) -> Result<DaemonStatus> {
        self.stop(true).await?;
        self.ensure_running().await
    }

    /// Current child status.
    pub async fn status(&self) -> DaemonStatus {
        status_of(&*self.state.lock().await)
    }

    fn resolve_workspace(&self) -> PathBuf {
        let configured = self
            .settings
            .load_settings()
            .ok()
            .and_then(|s| s.workspace_override)
            .map_or_else(|| self.config.workspace(), PathBuf::from);

        if std::fs::create_dir_all(&configured).is_ok() {
            return configured;
        }

        // Unreachable override: fall back to the default workspace and
        // clear the user setting so the bad path does not stick.
        warn!(path = %configured.display(), "configured workspace unreachable, falling back");
        if let Ok(mut settings) = self.settings.load_settings() {
            if settings.workspace_override.is_some() {
                settings.workspace_override = None;
                let _ = self.settings.save_settings(&settings);
            }
        }
        let fallback = if self.config.default_workspace.is_empty() {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
        } else {
            PathBuf::from(&self.config.default_workspace)
        };
        let _ = std::fs::create_dir_all(&fallback);
        fallback
    }

    fn spawn_child(&self, workspace: &Path) -> Result<tokio::process::Child> {
        let sup = &self.config.supervisor;
        let mut cmd = Command::new(&sup.agent_binary);
        cmd.args(&sup.agent_args);

        // Strip the inherited environment, then inject the allowlist plus
        // the agent-facing variables.
        cmd.env_clear();
        for &key in BASE_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        for &key in AGENT_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env("HAPPY_AGENT_HOME", self.config.agent_home());
        cmd.env("HAPPY_SERVER_URL", normalize_server_url(&self.config.agent.server_url));

        cmd.current_dir(workspace)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            // The child outlives individual sessions and reconnects; only
            // an explicit stop tears it down.
            .kill_on_drop(false);

        cmd.spawn()
            .map_err(|err| AppError::AgentStartFailed(format!("failed to spawn agent child: {err}")))
    }

    async fn handle_child_exit(self: Arc<Self>, exit_code: Option<i32>) {
        let (uptime, stopping, auto_restart) = {
            let mut state = self.state.lock().await;
            let uptime = state.started_instant.map_or(Duration::ZERO, |t| t.elapsed());
            state.pid = None;
            state.port = None;
            state.started_instant = None;
            state.last_exit_code = exit_code;
            state.kill_tx = None;
            (uptime, state.stopping, state.auto_restart)
        };
        let _ = self.running_tx.send(false);
        self.bus
            .publish_infra(BusEvent::DaemonStatusChanged { running: false, pid: None });

        if stopping {
            info!(?exit_code, "agent child stopped on request");
            return;
        }

        if uptime < STARTUP_CRASH_WINDOW {
            error!(?exit_code, ?uptime, "agent child crashed during startup");
            self.bus.publish_infra(BusEvent::DaemonFailed {
                kind: "AgentStartFailed".into(),
                message: format!("agent child exited {exit_code:?} within {uptime:?} of start"),
            });
            return;
        }

        let mut state = self.state.lock().await;
        let looped = state.last_crash_at.is_some_and(|t| t.elapsed() < CRASH_LOOP_WINDOW);
        state.last_crash_at = Some(Instant::now());
        if looped {
            state.auto_restart = false;
            drop(state);
            error!(?exit_code, "agent child crash loop, auto-restart disabled");
            self.bus.publish_infra(BusEvent::DaemonFailed {
                kind: "CrashLoop".into(),
                message: "two crashes inside the loop window; auto-restart disabled".into(),
            });
            return;
        }
        drop(state);

        if auto_restart {
            warn!(?exit_code, "agent child crashed, attempting single auto-restart");
            Self::schedule_auto_restart(Arc::clone(&self));
        }
    }

    /// Spawn the delayed auto-restart task.
    ///
    /// Defined outside [`ensure_running`](Self::ensure_running) so the
    /// compiler does not have to resolve that method's opaque return type
    /// while still defining it (a recursive-opaque-type limitation when the
    /// retry call is nested directly inside its own body).
    fn schedule_auto_restart(restart_self: Arc<Self>) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Err(err) = restart_self.ensure_running().await {
                error!(%err, "auto-restart failed");
            }
        });
    }

    fn check_workspace_consistency(&self, reported: Option<&str>, configured: &Path) {
        let Some(reported) = reported else {
            return;
        };
        if Path::new(reported) == configured {
            return;
        }
        // The user-configured path wins over whatever the child reports.
        let Some(router) = self.router.get().and_then(Weak::upgrade) else {
            debug!("no router wired; skipping workspace consistency check");
            return;
        };
        let configured = configured.to_path_buf();
        info!(reported, configured = %configured.display(),
            "agent workspace disagrees with configuration, switching");
        tokio::spawn(async move {
            if let Err(err) = router.switch_workspace(&configured).await {
                warn!(%err, "workspace consistency switch failed");
            }
        });
    }

    fn progress(&self, phase: &str, percent: u8) {
        self.bus.publish_infra(BusEvent::DaemonStartProgress {
            phase: phase.to_owned(),
            percent,
        });
    }
}

fn status_of(state: &SupState) -> DaemonStatus {
    DaemonStatus {
        running: state.pid.is_some(),
        pid: state.pid,
        port: state.port,
        started_at: state.started_at,
        last_exit_code: state.last_exit_code,
    }
}

#[cfg(unix)]
fn terminate_politely(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Ok(pid) = i32::try_from(pid) {
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(pid, %err, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn terminate_politely(_pid: u32) {
    // No polite signal on this platform; the caller escalates to kill.
}

/// Watch for `happy:secretChanged` and restart the child, then reconnect
/// the current session so the new credential takes effect.
pub fn spawn_secret_rotation_task(
    supervisor: Arc<Supervisor>,
    router: Arc<SessionRouter>,
    bus: &Arc<EventBus>,
) -> tokio::task::JoinHandle<()> {
    let sub = bus.subscribe(
        SubscriptionFilter { session_id: None, kinds: Some(std::collections::HashSet::new()), include_infra: true },
        None,
        DropPolicy::DropOldest,
    );
    tokio::spawn(async move {
        while let Some(delivery) = sub.recv().await {
            let crate::bus::Delivery::Event(BusEvent::SecretChanged { key }) = delivery else {
                continue;
            };
            info!(%key, "secret changed; restarting agent child");
            if let Err(err) = supervisor.restart().await {
                error!(%err, "restart after secret change failed");
                continue;
            }
            if let Err(err) = router.reconnect_current().await {
                warn!(%err, "reconnect after secret rotation failed");
            }
        }
    })
}
