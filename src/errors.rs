//! Error types shared across the daemon.
//!
//! Every failure mode carries a stable `kind` string (mirrored onto
//! `happy:error` events and API error bodies) and a retriability
//! classification. Transport errors are recovered locally via reconnect
//! backoff; everything else propagates to the originating caller.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    // ── Transport ───────────────────────────────────────
    /// The duplex link to the agent went silent or dropped.
    LinkLost(String),
    /// The agent backend could not be reached at all.
    NetworkUnavailable(String),
    /// The agent backend refused the connection attempt.
    ServerRejected(String),

    // ── Credential ──────────────────────────────────────
    /// No credential is available in the secret store or agent home.
    CredentialsMissing(String),
    /// The credential was rejected or could not be decrypted.
    CredentialsInvalid(String),

    // ── Routing ─────────────────────────────────────────
    /// No adapter is registered under the given channel id.
    UnknownChannel(String),
    /// No session exists under the given name or id.
    UnknownSession(String),
    /// No pending permission prompt matches the given id.
    UnknownPrompt(String),
    /// The permission prompt was already resolved.
    AlreadyResolved(String),
    /// The session is not connected to the agent.
    NotConnected(String),
    /// A live agent link already exists for this session name.
    AlreadyConnected(String),

    // ── Policy ──────────────────────────────────────────
    /// Channel policy denied the inbound message.
    PolicyRejected(String),
    /// The channel has too many requests in flight.
    Throttled(String),
    /// A workspace switch is in progress and the buffer is full.
    SwitchInProgress(String),

    // ── Timeout ─────────────────────────────────────────
    /// The agent produced no turn boundary within the turn timeout.
    TurnTimeout(String),
    /// Reconnect attempts were exhausted without restoring the link.
    ReconnectExhausted(String),
    /// The child did not exit within the graceful-stop window.
    GracefulStopTimeout(String),

    // ── Fatal ───────────────────────────────────────────
    /// The agent child crashed during startup; treated as misconfiguration.
    AgentStartFailed(String),
    /// Repeated child crashes disabled auto-restart.
    CrashLoop(String),

    // ── Local ───────────────────────────────────────────
    /// The requested workspace directory could not be created.
    DirectoryNotCreatable(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// JSON (de)serialisation failure.
    Serde(String),
}

impl AppError {
    /// Stable machine-readable kind string, used on the wire and in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LinkLost(_) => "LinkLost",
            Self::NetworkUnavailable(_) => "NetworkUnavailable",
            Self::ServerRejected(_) => "ServerRejected",
            Self::CredentialsMissing(_) => "CredentialsMissing",
            Self::CredentialsInvalid(_) => "CredentialsInvalid",
            Self::UnknownChannel(_) => "UnknownChannel",
            Self::UnknownSession(_) => "UnknownSession",
            Self::UnknownPrompt(_) => "UnknownPrompt",
            Self::AlreadyResolved(_) => "AlreadyResolved",
            Self::NotConnected(_) => "NotConnected",
            Self::AlreadyConnected(_) => "AlreadyConnected",
            Self::PolicyRejected(_) => "PolicyRejected",
            Self::Throttled(_) => "Throttled",
            Self::SwitchInProgress(_) => "SwitchInProgress",
            Self::TurnTimeout(_) => "TurnTimeout",
            Self::ReconnectExhausted(_) => "ReconnectExhausted",
            Self::GracefulStopTimeout(_) => "GracefulStopTimeout",
            Self::AgentStartFailed(_) => "AgentStartFailed",
            Self::CrashLoop(_) => "CrashLoop",
            Self::DirectoryNotCreatable(_) => "DirectoryNotCreatable",
            Self::Config(_) => "Config",
            Self::Io(_) => "Io",
            Self::Serde(_) => "Serde",
        }
    }

    /// Whether the failure is transient and recovered by reconnect backoff.
    ///
    /// Only transport-class errors are retriable; all other kinds propagate
    /// to the caller and are mirrored onto the event bus.
    #[must_use]
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            Self::LinkLost(_) | Self::NetworkUnavailable(_) | Self::ServerRejected(_)
        )
    }

    /// Inner human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::LinkLost(msg)
            | Self::NetworkUnavailable(msg)
            | Self::ServerRejected(msg)
            | Self::CredentialsMissing(msg)
            | Self::CredentialsInvalid(msg)
            | Self::UnknownChannel(msg)
            | Self::UnknownSession(msg)
            | Self::UnknownPrompt(msg)
            | Self::AlreadyResolved(msg)
            | Self::NotConnected(msg)
            | Self::AlreadyConnected(msg)
            | Self::PolicyRejected(msg)
            | Self::Throttled(msg)
            | Self::SwitchInProgress(msg)
            | Self::TurnTimeout(msg)
            | Self::ReconnectExhausted(msg)
            | Self::GracefulStopTimeout(msg)
            | Self::AgentStartFailed(msg)
            | Self::CrashLoop(msg)
            | Self::DirectoryNotCreatable(msg)
            | Self::Config(msg)
            | Self::Io(msg)
            | Self::Serde(msg) => msg,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
