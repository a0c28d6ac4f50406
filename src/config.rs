//! Global configuration parsing, validation, and environment overrides.
//!
//! Configuration is loaded from a TOML file, then overlaid with the
//! `HAPPY_*` / `ANTHROPIC_*` environment variables. All durations are
//! plain seconds in the file; defaults follow the daemon's documented
//! behavior (turn timeout 120 s, liveness threshold 60 s, ledger caps
//! 5000 entries / 120 minutes).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Environment variables recognised as overrides and injected into the
/// agent child process by the supervisor.
pub const AGENT_ENV_VARS: &[&str] = &[
    "HAPPY_SERVER_URL",
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_AUTH_TOKEN",
    "ANTHROPIC_MODEL",
    "ANTHROPIC_SMALL_FAST_MODEL",
    "API_TIMEOUT_MS",
    "CLAUDE_CODE_DISABLE_NONESSENTIAL_TRAFFIC",
];

/// HTTP API settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct HttpConfig {
    /// Port for the local HTTP/WebSocket API.
    pub port: u16,
    /// Bind address; loopback only by default.
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 3333, bind: "127.0.0.1".into() }
    }
}

/// Browser-extension control-plane settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ExtensionConfig {
    /// Port for the extension WebSocket listener.
    pub port: u16,
    /// Seconds to wait for an extension response before failing a request.
    pub request_timeout_seconds: u64,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self { port: 3334, request_timeout_seconds: 30 }
    }
}

/// Remote agent connection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct AgentConfig {
    /// Base URL of the agent account server.
    pub server_url: String,
    /// Liveness threshold; a silent upstream longer than this is a lost link.
    pub liveness_seconds: u64,
    /// Base reconnect backoff delay.
    pub reconnect_base_seconds: u64,
    /// Reconnect backoff cap.
    pub reconnect_cap_seconds: u64,
    /// Reconnect attempts before `ReconnectExhausted`.
    pub reconnect_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "https://api.happy.engineering".into(),
            liveness_seconds: 60,
            reconnect_base_seconds: 1,
            reconnect_cap_seconds: 30,
            reconnect_attempts: 5,
        }
    }
}

/// Agent child-process supervision settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SupervisorConfig {
    /// Agent child binary.
    pub agent_binary: String,
    /// Default arguments passed to the child.
    pub agent_args: Vec<String>,
    /// Agent home directory holding `access.key` and `settings.json`.
    /// Empty means `<data_dir>/agent-home`.
    pub agent_home: String,
    /// Seconds to wait for the child's ready signal.
    pub startup_timeout_seconds: u64,
    /// Grace period before escalating a graceful stop.
    pub grace_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_binary: "happy-agent".into(),
            agent_args: vec![],
            agent_home: String::new(),
            startup_timeout_seconds: 30,
            grace_seconds: 10,
        }
    }
}

/// Channel-bridge settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BridgeConfig {
    /// Per-turn reply timeout.
    pub turn_timeout_seconds: u64,
    /// Inbounds buffered during a workspace switch before `SwitchInProgress`.
    pub switch_buffer_cap: usize,
    /// Maximum in-flight requests per channel before `Throttled`.
    pub max_pending_per_channel: usize,
    /// Entries retained per chat in the rolling scrollback.
    pub scrollback_cap: usize,
    /// Whether an aborted turn delivers its partial text to the channel.
    pub deliver_partial_on_abort: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            turn_timeout_seconds: 120,
            switch_buffer_cap: 100,
            max_pending_per_channel: 32,
            scrollback_cap: 20,
            deliver_partial_on_abort: false,
        }
    }
}

/// Message-ledger retention settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct LedgerConfig {
    /// Maximum retained entries per session.
    pub max_entries: usize,
    /// Maximum age of retained entries, in minutes.
    pub max_age_minutes: i64,
    /// Maximum stored bytes per session.
    pub max_bytes: usize,
    /// Whether to persist append-only shards under `messages/`.
    pub persist_shards: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_entries: 5_000,
            max_age_minutes: 120,
            max_bytes: 8 * 1024 * 1024,
            persist_shards: true,
        }
    }
}

/// Event-bus defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BusConfig {
    /// Default per-subscription queue capacity.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

/// Permission-broker settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct PermissionConfig {
    /// Optional sweep interval expiring prompts older than the given age.
    /// Zero disables the sweeper (prompts then never time out).
    pub expire_after_seconds: u64,
}

/// Global configuration parsed from `config.toml` plus env overrides.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// Platform data directory; empty means the platform default
    /// (`~/.happy` equivalent under the OS data dir).
    pub data_dir: String,
    /// Default workspace directory for new sessions; empty means the
    /// user's home directory.
    pub default_workspace: String,
    /// Optional user workspace override, switched at runtime.
    pub workspace_override: Option<String>,
    /// HTTP API settings.
    pub http: HttpConfig,
    /// Browser-extension control plane settings.
    pub extension: ExtensionConfig,
    /// Remote agent settings.
    pub agent: AgentConfig,
    /// Child supervision settings.
    pub supervisor: SupervisorConfig,
    /// Channel bridge settings.
    pub bridge: BridgeConfig,
    /// Ledger retention settings.
    pub ledger: LedgerConfig,
    /// Event bus settings.
    pub bus: BusConfig,
    /// Permission broker settings.
    pub permissions: PermissionConfig,
    /// Per-channel language tags for localized notices (e.g. `feishu = "zh"`).
    pub channel_locales: HashMap<String, String>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string, apply env overrides, validate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the parsed file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HAPPY_SERVER_URL") {
            if !url.is_empty() {
                self.agent.server_url = url;
            }
        }
    }

    /// Resolved platform data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        if self.data_dir.is_empty() {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".happy")
        } else {
            PathBuf::from(&self.data_dir)
        }
    }

    /// Default workspace directory for new sessions, honoring the override.
    #[must_use]
    pub fn workspace(&self) -> PathBuf {
        if let Some(ref over) = self.workspace_override {
            return PathBuf::from(over);
        }
        if self.default_workspace.is_empty() {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
        } else {
            PathBuf::from(&self.default_workspace)
        }
    }

    /// Agent home directory holding `access.key` and `settings.json`.
    #[must_use]
    pub fn agent_home(&self) -> PathBuf {
        if self.supervisor.agent_home.is_empty() {
            self.data_dir().join("agent-home")
        } else {
            PathBuf::from(&self.supervisor.agent_home)
        }
    }

    /// Directory holding per-session ledger shards.
    #[must_use]
    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir().join("messages")
    }

    /// Path of the daemon pid file.
    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir().join("daemon.pid")
    }

    /// Turn timeout as a [`Duration`].
    #[must_use]
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.turn_timeout_seconds)
    }

    /// Liveness threshold as a [`Duration`].
    #[must_use]
    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.agent.liveness_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.bridge.switch_buffer_cap == 0 {
            return Err(AppError::Config("bridge.switch_buffer_cap must be greater than zero".into()));
        }
        if self.ledger.max_entries == 0 {
            return Err(AppError::Config("ledger.max_entries must be greater than zero".into()));
        }
        if self.bus.queue_capacity == 0 {
            return Err(AppError::Config("bus.queue_capacity must be greater than zero".into()));
        }
        if self.agent.reconnect_cap_seconds < self.agent.reconnect_base_seconds {
            return Err(AppError::Config(
                "agent.reconnect_cap_seconds must be at least reconnect_base_seconds".into(),
            ));
        }
        Ok(())
    }
}
