#![forbid(unsafe_code)]

//! `happyd` — local agent-bridge daemon binary.
//!
//! Bootstraps configuration, the supervised agent child, the session
//! router and channel bridge, the HTTP/WebSocket API, and the browser
//! extension control plane. Client subcommands (`stop`, `status`,
//! `open`) talk to a running daemon over its HTTP API.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use happyd::agent::transport::DaemonTransportFactory;
use happyd::bridge::policy::AllowAllPolicy;
use happyd::bridge::simulator::SimulatorAdapter;
use happyd::bridge::{ChannelBridge, SwitchGate};
use happyd::bus::{BusEvent, EventBus};
use happyd::config::GlobalConfig;
use happyd::http::extension::{serve_extension, ExtensionHub};
use happyd::http::{serve_http, AppState};
use happyd::ledger::{shard, MessageLedger};
use happyd::permissions::PermissionBroker;
use happyd::router::{SessionRouter, DEFAULT_SESSION};
use happyd::settings::{MachineIdentity, SettingsStore};
use happyd::supervisor::{credentials, spawn_secret_rotation_task, Supervisor};
use happyd::watcher::WorkspaceWatcher;
use happyd::{AppError, Result};

/// Exit code when the daemon cannot be reached.
const EXIT_UNREACHABLE: u8 = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "happyd", about = "Local agent-bridge daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; missing file means defaults.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP API port.
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon (foreground unless --daemon).
    Start {
        /// Detach into the background.
        #[arg(long)]
        daemon: bool,
    },
    /// Stop a running daemon.
    Stop,
    /// Show a running daemon's status.
    Status,
    /// Print the UI URL and open it in a browser.
    Open,
    /// Print the resolved configuration.
    Config,
    /// Initialize the data directory, config, and agent home.
    Deploy,
    /// Manage channel modules.
    Module {
        #[command(subcommand)]
        action: ModuleAction,
    },
}

#[derive(Debug, Subcommand)]
enum ModuleAction {
    /// List known modules and their toggles.
    List,
    /// Enable a channel module.
    Enable {
        /// Channel module id.
        id: String,
    },
    /// Disable a channel module.
    Disable {
        /// Channel module id.
        id: String,
    },
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(dispatch(args))
}

async fn dispatch(args: Cli) -> ExitCode {
    let config = match load_config(&args) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Start { daemon: true } => start_detached(&args),
        Command::Start { daemon: false } => match run_daemon(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(%err, "daemon failed");
                ExitCode::FAILURE
            }
        },
        Command::Stop => client_post(&config, "/api/shutdown").await,
        Command::Status => client_get(&config, "/api/status").await,
        Command::Open => open_ui(&config).await,
        Command::Config => {
            println!("{config:#?}");
            ExitCode::SUCCESS
        }
        Command::Deploy => deploy(&config),
        Command::Module { action } => module_command(&config, &action),
    }
}

fn load_config(args: &Cli) -> Result<GlobalConfig> {
    let mut config = if args.config.is_file() {
        GlobalConfig::load_from_path(&args.config)?
    } else {
        let mut config = GlobalConfig::default();
        config.apply_env_overrides();
        config
    };
    if let Some(port) = args.port {
        config.http.port = port;
    }
    Ok(config)
}

// ── Daemon ───────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_lines)] // Startup sequence is inherently sequential.
async fn run_daemon(config: Arc<GlobalConfig>) -> Result<()> {
    info!("happyd bootstrap");
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    std::fs::write(config.pid_path(), std::process::id().to_string())?;

    let identity = MachineIdentity::of_this_machine();
    let settings = Arc::new(SettingsStore::new(data_dir, &identity));

    // ── Ledger + bus ────────────────────────────────────
    let ledger = Arc::new(MessageLedger::new(config.ledger.clone()));
    let bus = EventBus::new(Arc::clone(&ledger), config.bus.queue_capacity);

    let restored = shard::restore_shards(&config.messages_dir());
    for (session_id, events) in &restored {
        for event in events {
            let _ = ledger.append(event.clone());
        }
        info!(%session_id, count = events.len(), "restored ledger shard");
    }

    let ct = CancellationToken::new();
    let shard_handle = if config.ledger.persist_shards {
        let (shard_tx, shard_rx) = mpsc::unbounded_channel();
        ledger.attach_shard_writer(shard_tx);
        Some(shard::spawn_shard_writer(config.messages_dir(), shard_rx, ct.clone()))
    } else {
        None
    };

    // ── Core components ─────────────────────────────────
    let permissions = Arc::new(PermissionBroker::new());
    let supervisor = Supervisor::new(Arc::clone(&config), Arc::clone(&settings), Arc::clone(&bus));
    let factory = Arc::new(DaemonTransportFactory::new(Arc::clone(&supervisor)));
    let gate = SwitchGate::new(config.bridge.switch_buffer_cap);
    let router = SessionRouter::new(
        Arc::clone(&config),
        Arc::clone(&settings),
        factory,
        Arc::clone(&bus),
        Arc::clone(&permissions),
        gate,
    );
    supervisor.set_router(Arc::downgrade(&router));

    let bridge = ChannelBridge::new(Arc::clone(&config), Arc::clone(&router), Arc::clone(&bus));
    let bridge_task = bridge.start();
    bridge.register_channel(Arc::new(SimulatorAdapter::new()), Arc::new(AllowAllPolicy))?;

    let rotation_task =
        spawn_secret_rotation_task(Arc::clone(&supervisor), Arc::clone(&router), &bus);

    // Announce restored history now that subscribers can attach.
    for (session_id, events) in restored {
        bus.publish_infra(BusEvent::MessagesRestored {
            session_id,
            count: events.len(),
        });
    }

    // ── Optional permission expiry sweeper ──────────────
    let sweeper_task = if config.permissions.expire_after_seconds > 0 {
        let permissions = Arc::clone(&permissions);
        let max_age = i64::try_from(config.permissions.expire_after_seconds).unwrap_or(i64::MAX);
        let sweep_ct = ct.clone();
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    () = sweep_ct.cancelled() => break,
                    _ = tick.tick() => {
                        let deadline = Utc::now() - chrono::Duration::seconds(max_age);
                        let expired = permissions.expire_older_than(deadline);
                        if expired > 0 {
                            info!(expired, "expired stale permission prompts");
                        }
                    }
                }
            }
        }))
    } else {
        None
    };

    // ── Workspace observer ──────────────────────────────
    let watcher = match WorkspaceWatcher::spawn(&config.workspace(), Arc::clone(&bus)) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(%err, "workspace watcher unavailable");
            None
        }
    };

    // ── Surfaces ────────────────────────────────────────
    let extension = ExtensionHub::new(Duration::from_secs(
        config.extension.request_timeout_seconds,
    ));
    let ext_ct = ct.clone();
    let ext_hub = Arc::clone(&extension);
    let ext_bind = config.http.bind.clone();
    let ext_port = config.extension.port;
    let extension_task = tokio::spawn(async move {
        if let Err(err) = serve_extension(ext_hub, &ext_bind, ext_port, ext_ct).await {
            error!(%err, "extension listener failed");
        }
    });

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        settings: Arc::clone(&settings),
        router: Arc::clone(&router),
        bridge: Arc::clone(&bridge),
        bus: Arc::clone(&bus),
        ledger: Arc::clone(&ledger),
        supervisor: Arc::clone(&supervisor),
        permissions: Arc::clone(&permissions),
        started_at: Utc::now(),
        extension,
        shutdown: ct.clone(),
    });

    let http_ct = ct.clone();
    let http_shutdown_ct = ct.clone();
    let http_task = tokio::spawn(async move {
        if let Err(err) = serve_http(state, http_ct).await {
            error!(%err, "HTTP API failed — initiating shutdown");
            http_shutdown_ct.cancel();
        }
    });

    // ── Eager connect when credentials exist ────────────
    if credentials::credentials_present(&config, &settings) {
        let startup_router = Arc::clone(&router);
        tokio::spawn(async move {
            match startup_router.connect(DEFAULT_SESSION).await {
                Ok(handle) => info!(session_id = handle.session_id(), "startup session connected"),
                Err(err) => warn!(%err, "startup connect failed; waiting for a client"),
            }
        });
    } else {
        info!("no credentials yet; sessions connect on first client request");
    }

    bus.publish_infra(BusEvent::Initialized);
    info!(port = config.http.port, "happyd ready");

    // ── Wait for shutdown ───────────────────────────────
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        () = ct.cancelled() => info!("shutdown requested via API"),
    }
    ct.cancel();

    // Second signal forces exit.
    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    let shutdown = async {
        router.disconnect_all().await;
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        rotation_task.abort();
        bridge_task.abort();
        if let Some(task) = sweeper_task {
            let _ = task.await;
        }
        let _ = http_task.await;
        let _ = extension_task.await;
        if let Some(task) = shard_handle {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), shutdown).await.is_err() {
        error!("graceful shutdown timed out — exiting");
    }

    let _ = std::fs::remove_file(config.pid_path());
    info!("happyd shut down");
    Ok(())
}

fn start_detached(args: &Cli) -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            eprintln!("cannot resolve current executable: {err}");
            return ExitCode::FAILURE;
        }
    };
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--config").arg(&args.config);
    if let Some(port) = args.port {
        cmd.arg("--port").arg(port.to_string());
    }
    cmd.arg("start")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    match cmd.spawn() {
        Ok(child) => {
            println!("happyd started in background (pid {})", child.id());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to start background daemon: {err}");
            ExitCode::FAILURE
        }
    }
}

// ── Client subcommands ───────────────────────────────────────────────────────

fn base_url(config: &GlobalConfig) -> String {
    format!("http://127.0.0.1:{}", config.http.port)
}

async fn client_get(config: &GlobalConfig, path: &str) -> ExitCode {
    match http_client().get(format!("{}{path}", base_url(config))).send().await {
        Ok(response) => print_api_response(response).await,
        Err(err) => unreachable_exit(&err),
    }
}

async fn client_post(config: &GlobalConfig, path: &str) -> ExitCode {
    match http_client()
        .post(format!("{}{path}", base_url(config)))
        .json(&serde_json::json!({}))
        .send()
        .await
    {
        Ok(response) => print_api_response(response).await,
        Err(err) => unreachable_exit(&err),
    }
}

async fn open_ui(config: &GlobalConfig) -> ExitCode {
    let url = base_url(config);
    if http_client().get(format!("{url}/api/status")).send().await.is_err() {
        eprintln!("happyd is not running on {url}");
        return ExitCode::from(EXIT_UNREACHABLE);
    }
    println!("{url}");

    #[cfg(target_os = "macos")]
    let opener = "open";
    #[cfg(not(target_os = "macos"))]
    let opener = "xdg-open";
    if std::process::Command::new(opener).arg(&url).spawn().is_err() {
        eprintln!("could not launch a browser; open the URL manually");
    }
    ExitCode::SUCCESS
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default()
}

async fn print_api_response(response: reqwest::Response) -> ExitCode {
    let status = response.status();
    match response.json::<serde_json::Value>().await {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            if status.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("unexpected response: {err}");
            ExitCode::FAILURE
        }
    }
}

fn unreachable_exit(err: &reqwest::Error) -> ExitCode {
    eprintln!("cannot reach happyd: {err}");
    ExitCode::from(EXIT_UNREACHABLE)
}

// ── Local maintenance subcommands ────────────────────────────────────────────

fn deploy(config: &GlobalConfig) -> ExitCode {
    let data_dir = config.data_dir();
    if let Err(err) = std::fs::create_dir_all(&data_dir) {
        eprintln!("cannot create data dir {}: {err}", data_dir.display());
        return ExitCode::FAILURE;
    }
    if let Err(err) = std::fs::create_dir_all(config.messages_dir()) {
        eprintln!("cannot create messages dir: {err}");
        return ExitCode::FAILURE;
    }

    let identity = MachineIdentity::of_this_machine();
    let settings = SettingsStore::new(data_dir.clone(), &identity);
    match credentials::sync_agent_home(config, &settings) {
        Ok(()) => println!("agent home ready at {}", config.agent_home().display()),
        Err(AppError::CredentialsMissing(_)) => {
            println!(
                "agent home prepared; no access key yet — store one via the settings API \
                 or the OS keychain"
            );
        }
        Err(err) => {
            eprintln!("agent home setup failed: {err}");
            return ExitCode::FAILURE;
        }
    }
    println!("data directory ready at {}", data_dir.display());
    ExitCode::SUCCESS
}

fn module_command(config: &GlobalConfig, action: &ModuleAction) -> ExitCode {
    let identity = MachineIdentity::of_this_machine();
    let settings = SettingsStore::new(config.data_dir(), &identity);
    let mut current = match settings.load_settings() {
        Ok(current) => current,
        Err(err) => {
            eprintln!("cannot load settings: {err}");
            return ExitCode::FAILURE;
        }
    };

    match action {
        ModuleAction::List => {
            if current.modules.is_empty() {
                println!("no channel modules configured");
            }
            for (id, enabled) in &current.modules {
                println!("{id}: {}", if *enabled { "enabled" } else { "disabled" });
            }
            ExitCode::SUCCESS
        }
        ModuleAction::Enable { id } | ModuleAction::Disable { id } => {
            let enable = matches!(action, ModuleAction::Enable { .. });
            current.modules.insert(id.clone(), enable);
            match settings.save_settings(&current) {
                Ok(()) => {
                    println!("{id}: {}", if enable { "enabled" } else { "disabled" });
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("cannot save settings: {err}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

// ── Infrastructure ───────────────────────────────────────────────────────────

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
