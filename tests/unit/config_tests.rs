//! Unit tests for configuration parsing, defaults, and validation.

use happyd::config::GlobalConfig;

#[test]
fn defaults_match_documented_behavior() {
    let config = GlobalConfig::default();
    assert_eq!(config.http.port, 3333);
    assert_eq!(config.extension.port, 3334);
    assert_eq!(config.bridge.turn_timeout_seconds, 120);
    assert_eq!(config.bridge.switch_buffer_cap, 100);
    assert_eq!(config.agent.liveness_seconds, 60);
    assert_eq!(config.agent.reconnect_base_seconds, 1);
    assert_eq!(config.agent.reconnect_cap_seconds, 30);
    assert_eq!(config.agent.reconnect_attempts, 5);
    assert_eq!(config.ledger.max_entries, 5_000);
    assert_eq!(config.ledger.max_age_minutes, 120);
    assert_eq!(config.bus.queue_capacity, 256);
    assert_eq!(config.supervisor.grace_seconds, 10);
}

#[test]
fn empty_toml_parses_to_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("parse");
    assert_eq!(config.http.port, 3333);
}

#[test]
fn sections_override_defaults() {
    let toml = r#"
        [http]
        port = 4444

        [bridge]
        turn_timeout_seconds = 30
        switch_buffer_cap = 10

        [channel_locales]
        feishu = "zh"
    "#;
    let config = GlobalConfig::from_toml_str(toml).expect("parse");
    assert_eq!(config.http.port, 4444);
    assert_eq!(config.bridge.turn_timeout_seconds, 30);
    assert_eq!(config.bridge.switch_buffer_cap, 10);
    assert_eq!(config.channel_locales.get("feishu").map(String::as_str), Some("zh"));
}

#[test]
fn zero_switch_buffer_is_rejected() {
    let toml = "[bridge]\nswitch_buffer_cap = 0\n";
    assert!(GlobalConfig::from_toml_str(toml).is_err());
}

#[test]
fn zero_ledger_entries_is_rejected() {
    let toml = "[ledger]\nmax_entries = 0\n";
    assert!(GlobalConfig::from_toml_str(toml).is_err());
}

#[test]
fn reconnect_cap_below_base_is_rejected() {
    let toml = "[agent]\nreconnect_base_seconds = 10\nreconnect_cap_seconds = 2\n";
    assert!(GlobalConfig::from_toml_str(toml).is_err());
}

#[test]
fn invalid_toml_is_a_config_error() {
    assert!(GlobalConfig::from_toml_str("[http\nport=1").is_err());
}

#[test]
fn derived_paths_hang_off_the_data_dir() {
    let toml = "data_dir = \"/tmp/happy-test\"\n";
    let config = GlobalConfig::from_toml_str(toml).expect("parse");
    assert_eq!(config.messages_dir(), std::path::Path::new("/tmp/happy-test/messages"));
    assert_eq!(config.pid_path(), std::path::Path::new("/tmp/happy-test/daemon.pid"));
    assert_eq!(config.agent_home(), std::path::Path::new("/tmp/happy-test/agent-home"));
}

#[test]
fn workspace_override_wins() {
    let toml = r#"
        default_workspace = "/srv/default"
        workspace_override = "/srv/override"
    "#;
    let config = GlobalConfig::from_toml_str(toml).expect("parse");
    assert_eq!(config.workspace(), std::path::Path::new("/srv/override"));
}
