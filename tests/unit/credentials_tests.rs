//! Unit tests for agent-home credential materialization.

use happyd::config::GlobalConfig;
use happyd::settings::{MachineIdentity, SettingsStore};
use happyd::supervisor::credentials::{
    credentials_present, sync_agent_home, ACCESS_KEY_SECRET,
};
use happyd::AppError;

fn identity() -> MachineIdentity {
    MachineIdentity {
        hostname: "test-host".into(),
        home: "/home/tester".into(),
        platform: "linux".into(),
        arch: "x86_64".into(),
        user: "tester".into(),
    }
}

struct Env {
    _dir: tempfile::TempDir,
    config: GlobalConfig,
    store: SettingsStore,
}

fn env() -> Env {
    let dir = tempfile::tempdir().expect("tempdir");
    let toml = format!("data_dir = {:?}\n", dir.path().to_string_lossy());
    let config = GlobalConfig::from_toml_str(&toml).expect("config");
    let store = SettingsStore::without_keyring(dir.path().to_path_buf(), &identity());
    Env { _dir: dir, config, store }
}

#[test]
fn missing_secret_blocks_with_credentials_missing() {
    let env = env();
    let err = sync_agent_home(&env.config, &env.store).expect_err("no secret anywhere");
    assert!(matches!(err, AppError::CredentialsMissing(_)), "got {err:?}");
    assert!(!credentials_present(&env.config, &env.store));
}

#[test]
fn secret_is_materialized_into_both_files() {
    let env = env();
    env.store.set_secret(ACCESS_KEY_SECRET, "sk-test-123").expect("store secret");

    sync_agent_home(&env.config, &env.store).expect("sync succeeds");

    let home = env.config.agent_home();
    let key = std::fs::read_to_string(home.join("access.key")).expect("access.key written");
    assert_eq!(key, "sk-test-123");

    let settings: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(home.join("settings.json")).expect("read"))
            .expect("parse");
    let url = settings["serverUrl"].as_str().expect("serverUrl present");
    assert!(!url.ends_with('/'), "serverUrl must not keep a trailing slash");

    assert!(credentials_present(&env.config, &env.store));
}

#[test]
fn sync_is_idempotent() {
    let env = env();
    env.store.set_secret(ACCESS_KEY_SECRET, "sk-test").expect("store secret");
    sync_agent_home(&env.config, &env.store).expect("first sync");
    sync_agent_home(&env.config, &env.store).expect("second sync");
}

#[test]
fn existing_settings_file_gets_trailing_slash_repair() {
    let env = env();
    env.store.set_secret(ACCESS_KEY_SECRET, "sk").expect("store secret");

    let home = env.config.agent_home();
    std::fs::create_dir_all(&home).expect("mkdir");
    std::fs::write(
        home.join("settings.json"),
        r#"{ "serverUrl": "https://api.example.com///", "keepMe": 7 }"#,
    )
    .expect("seed settings");

    sync_agent_home(&env.config, &env.store).expect("sync");

    let settings: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(home.join("settings.json")).expect("read"))
            .expect("parse");
    assert_eq!(settings["serverUrl"], "https://api.example.com");
    // Repair is surgical: unrelated keys survive.
    assert_eq!(settings["keepMe"], 7);
}

#[test]
fn existing_access_key_file_counts_as_credentials() {
    let env = env();
    let home = env.config.agent_home();
    std::fs::create_dir_all(&home).expect("mkdir");
    std::fs::write(home.join("access.key"), "sk-manual").expect("seed key");

    assert!(credentials_present(&env.config, &env.store));
    sync_agent_home(&env.config, &env.store).expect("sync keeps existing key");
    assert_eq!(
        std::fs::read_to_string(home.join("access.key")).expect("read"),
        "sk-manual"
    );
}
