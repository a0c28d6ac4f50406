//! Agent home credential materialization.
//!
//! Before the child starts, the agent home must contain both the access
//! key and the settings file. Missing files are materialized from the
//! local secret store; startup never blocks on verifying the key with the
//! server, only on file presence. The `serverUrl` value is repaired
//! (trailing slashes stripped) locally and never pushed back upstream.

use std::path::Path;

use serde_json::json;
use tracing::{debug, info};

use crate::config::GlobalConfig;
use crate::settings::{atomic_write, normalize_server_url, SettingsStore};
use crate::{AppError, Result};

/// Secret-store key holding the agent access key.
pub const ACCESS_KEY_SECRET: &str = "access_key";

const ACCESS_KEY_FILE: &str = "access.key";
const AGENT_SETTINGS_FILE: &str = "settings.json";

/// Whether a credential is available from any source (agent home file or
/// the local secret store). Used at startup to decide whether to connect
/// eagerly.
#[must_use]
pub fn credentials_present(config: &GlobalConfig, settings: &SettingsStore) -> bool {
    if config.agent_home().join(ACCESS_KEY_FILE).is_file() {
        return true;
    }
    matches!(settings.get_secret(ACCESS_KEY_SECRET), Ok(Some(_)))
}

/// Ensure the agent home holds `access.key` and `settings.json`.
///
/// # Errors
///
/// - `AppError::CredentialsMissing` — no access key anywhere.
/// - `AppError::Io` — the home directory or files cannot be written.
pub fn sync_agent_home(config: &GlobalConfig, settings: &SettingsStore) -> Result<()> {
    let home = config.agent_home();
    std::fs::create_dir_all(&home)?;

    ensure_access_key(&home, settings)?;
    ensure_agent_settings(&home, &config.agent.server_url)?;
    Ok(())
}

fn ensure_access_key(home: &Path, settings: &SettingsStore) -> Result<()> {
    let key_path = home.join(ACCESS_KEY_FILE);
    if key_path.is_file() {
        debug!(path = %key_path.display(), "access key present");
        return Ok(());
    }

    let Some(secret) = settings.get_secret(ACCESS_KEY_SECRET)? else {
        return Err(AppError::CredentialsMissing(
            "no access key in agent home or secret store".into(),
        ));
    };

    atomic_write(&key_path, secret.as_bytes())?;
    info!(path = %key_path.display(), "materialized access key from secret store");
    Ok(())
}

fn ensure_agent_settings(home: &Path, server_url: &str) -> Result<()> {
    let settings_path = home.join(AGENT_SETTINGS_FILE);

    if settings_path.is_file() {
        // Repair a trailing-slash serverUrl in place; leave everything
        // else untouched.
        let raw = std::fs::read_to_string(&settings_path)?;
        let mut value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| AppError::CredentialsInvalid(format!("agent settings: {err}")))?;
        if let Some(url) = value.get("serverUrl").and_then(serde_json::Value::as_str) {
            let fixed = normalize_server_url(url);
            if fixed != url {
                value["serverUrl"] = serde_json::Value::String(fixed);
                atomic_write(&settings_path, serde_json::to_string_pretty(&value)?.as_bytes())?;
                info!(path = %settings_path.display(), "repaired serverUrl trailing slash");
            }
        }
        return Ok(());
    }

    let body = json!({ "serverUrl": normalize_server_url(server_url) });
    atomic_write(&settings_path, serde_json::to_string_pretty(&body)?.as_bytes())?;
    info!(path = %settings_path.display(), "materialized agent settings file");
    Ok(())
}
