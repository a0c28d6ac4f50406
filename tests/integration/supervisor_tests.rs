//! Supervisor lifecycle against a scripted shell child (unix only).

use std::sync::Arc;
use std::time::Duration;

use happyd::bus::{BusEvent, Delivery, DropPolicy, EventBus, SubscriptionFilter};
use happyd::config::GlobalConfig;
use happyd::ledger::MessageLedger;
use happyd::settings::{MachineIdentity, SettingsStore};
use happyd::supervisor::credentials::ACCESS_KEY_SECRET;
use happyd::supervisor::Supervisor;
use happyd::AppError;
use serial_test::serial;

struct Fixture {
    config: Arc<GlobalConfig>,
    settings: Arc<SettingsStore>,
    bus: Arc<EventBus>,
    supervisor: Arc<Supervisor>,
    _dir: tempfile::TempDir,
}

fn identity() -> MachineIdentity {
    MachineIdentity {
        hostname: "test-host".into(),
        home: "/home/tester".into(),
        platform: "linux".into(),
        arch: "x86_64".into(),
        user: "tester".into(),
    }
}

/// Child script: announce readiness on port 45678, then idle.
const READY_AND_SLEEP: &str = r#"echo '{"ready":true,"port":45678}'; sleep 60"#;

fn fixture(script: &str) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = GlobalConfig::default();
    config.data_dir = dir.path().to_string_lossy().into_owned();
    config.default_workspace = dir.path().join("workspace").to_string_lossy().into_owned();
    config.supervisor.agent_binary = "/bin/sh".into();
    config.supervisor.agent_args = vec!["-c".into(), script.into()];
    config.supervisor.startup_timeout_seconds = 5;
    config.supervisor.grace_seconds = 2;
    config.ledger.persist_shards = false;
    let config = Arc::new(config);

    let settings = Arc::new(SettingsStore::without_keyring(dir.path().to_path_buf(), &identity()));
    let ledger = Arc::new(MessageLedger::new(config.ledger.clone()));
    let bus = EventBus::new(ledger, config.bus.queue_capacity);
    let supervisor = Supervisor::new(Arc::clone(&config), Arc::clone(&settings), Arc::clone(&bus));

    Fixture { config, settings, bus, supervisor, _dir: dir }
}

#[tokio::test]
#[serial]
async fn ensure_running_repairs_credentials_and_starts_the_child() {
    let fix = fixture(READY_AND_SLEEP);
    fix.settings.set_secret(ACCESS_KEY_SECRET, "sk-repair-test").expect("store secret");

    let status = fix.supervisor.ensure_running().await.expect("start");
    assert!(status.running);
    assert!(status.pid.is_some());
    assert_eq!(status.port, Some(45_678));

    // The agent home was materialized from the secret store before spawn.
    let home = fix.config.agent_home();
    assert_eq!(
        std::fs::read_to_string(home.join("access.key")).expect("access.key"),
        "sk-repair-test"
    );
    assert!(home.join("settings.json").is_file());

    fix.supervisor.stop(true).await.expect("stop");
}

#[tokio::test]
#[serial]
async fn ensure_running_is_idempotent() {
    let fix = fixture(READY_AND_SLEEP);
    fix.settings.set_secret(ACCESS_KEY_SECRET, "sk").expect("store secret");

    let first = fix.supervisor.ensure_running().await.expect("first start");
    let second = fix.supervisor.ensure_running().await.expect("second call");
    assert_eq!(first.pid, second.pid, "idempotent ensure must not respawn");

    fix.supervisor.stop(true).await.expect("stop");
}

#[tokio::test]
#[serial]
async fn missing_credentials_block_startup() {
    let fix = fixture(READY_AND_SLEEP);
    let err = fix.supervisor.ensure_running().await.expect_err("no secret");
    assert!(matches!(err, AppError::CredentialsMissing(_)), "got {err:?}");
}

#[tokio::test]
#[serial]
async fn child_that_never_signals_ready_fails_startup() {
    let fix = fixture("sleep 60");
    fix.settings.set_secret(ACCESS_KEY_SECRET, "sk").expect("store secret");

    let err = fix.supervisor.ensure_running().await.expect_err("no ready signal");
    assert!(matches!(err, AppError::AgentStartFailed(_)), "got {err:?}");
}

#[tokio::test]
#[serial]
async fn graceful_stop_brings_the_child_down() {
    let fix = fixture(READY_AND_SLEEP);
    fix.settings.set_secret(ACCESS_KEY_SECRET, "sk").expect("store secret");
    fix.supervisor.ensure_running().await.expect("start");

    fix.supervisor.stop(true).await.expect("graceful stop");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = fix.supervisor.status().await;
        if !status.running {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "child survived stop");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
#[serial]
async fn status_changes_surface_on_the_bus() {
    let fix = fixture(READY_AND_SLEEP);
    fix.settings.set_secret(ACCESS_KEY_SECRET, "sk").expect("store secret");

    let sub = fix.bus.subscribe(SubscriptionFilter::all(), None, DropPolicy::DropOldest);
    fix.supervisor.ensure_running().await.expect("start");

    // Progress events first, then the running status change.
    let mut saw_progress = false;
    let mut saw_running = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(saw_progress && saw_running) {
        let delivery = tokio::time::timeout_at(deadline, sub.recv())
            .await
            .expect("bus event before timeout")
            .expect("bus open");
        match delivery {
            Delivery::Event(BusEvent::DaemonStartProgress { .. }) => saw_progress = true,
            Delivery::Event(BusEvent::DaemonStatusChanged { running: true, .. }) => {
                saw_running = true;
            }
            _ => {}
        }
    }

    fix.supervisor.stop(true).await.expect("stop");
}

#[tokio::test]
#[serial]
async fn restart_yields_a_new_pid() {
    let fix = fixture(READY_AND_SLEEP);
    fix.settings.set_secret(ACCESS_KEY_SECRET, "sk").expect("store secret");

    let first = fix.supervisor.ensure_running().await.expect("start");
    let second = fix.supervisor.restart().await.expect("restart");
    assert_ne!(first.pid, second.pid, "restart must spawn a fresh child");

    fix.supervisor.stop(true).await.expect("stop");
}
