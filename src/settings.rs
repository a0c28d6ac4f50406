//! Persisted daemon state: `settings.json`, `secure-settings.json`, and the
//! machine-key encryption wrapping individual secret entries.
//!
//! Plaintext settings are written atomically (tmp + rename). Secrets are
//! stored per key as `{encrypted: true, method: "crypto", data: <base64>}`;
//! the `method` tag selects the decryption path so ciphertexts produced by
//! other builds remain unambiguous. The preferred backend is the OS keychain;
//! the encrypted file is the fallback when no keychain is reachable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{AppError, Result};

const SETTINGS_FILE: &str = "settings.json";
const SECURE_SETTINGS_FILE: &str = "secure-settings.json";
const KEYRING_SERVICE: &str = "happyd";

/// Plaintext user settings persisted in `settings.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Agent account server URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// User workspace override; cleared when the path becomes unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_override: Option<String>,
    /// Channel module toggles keyed by channel id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, bool>,
}

/// One encrypted entry in `secure-settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecureEntry {
    /// Always `true`; plaintext entries are not written.
    pub encrypted: bool,
    /// Encryption method tag: `"crypto"` (AES-256-GCM) or `"sodium"`.
    pub method: String,
    /// Base64 of nonce-prefixed ciphertext.
    pub data: String,
}

/// Stable machine identity traits the encryption key is derived from.
///
/// The derivation is deterministic over exactly these five traits; adding a
/// trait would orphan existing ciphertexts and requires a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentity {
    /// Host name.
    pub hostname: String,
    /// Home directory path.
    pub home: String,
    /// Operating system identifier.
    pub platform: String,
    /// CPU architecture identifier.
    pub arch: String,
    /// Local user identity.
    pub user: String,
}

impl MachineIdentity {
    /// Collect the identity of the running machine.
    #[must_use]
    pub fn of_this_machine() -> Self {
        let home = dirs::home_dir().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        Self {
            hostname: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("COMPUTERNAME"))
                .unwrap_or_else(|_| "localhost".into()),
            home,
            platform: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
        }
    }

    /// Derive the 256-bit encryption key from the identity traits.
    #[must_use]
    pub fn derive_key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for part in [&self.hostname, &self.home, &self.platform, &self.arch, &self.user] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.finalize().into()
    }
}

/// Store for plaintext settings and encrypted secrets under the data dir.
pub struct SettingsStore {
    data_dir: PathBuf,
    key: [u8; 32],
    use_keyring: bool,
}

impl SettingsStore {
    /// Create a store rooted at `data_dir` with the machine-derived key.
    #[must_use]
    pub fn new(data_dir: PathBuf, identity: &MachineIdentity) -> Self {
        Self { data_dir, key: identity.derive_key(), use_keyring: true }
    }

    /// Create a store that skips the OS keychain (used by tests and
    /// headless environments without a keyring daemon).
    #[must_use]
    pub fn without_keyring(data_dir: PathBuf, identity: &MachineIdentity) -> Self {
        Self { data_dir, key: identity.derive_key(), use_keyring: false }
    }

    /// Load `settings.json`, returning defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serde` if the file exists but is not valid JSON.
    pub fn load_settings(&self) -> Result<Settings> {
        let path = self.data_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Settings::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist `settings.json` atomically.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the write or rename fails.
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(settings)?;
        atomic_write(&self.data_dir.join(SETTINGS_FILE), json.as_bytes())
    }

    /// Fetch a secret by key: OS keychain first, encrypted file second.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CredentialsInvalid` if a stored entry cannot be
    /// decrypted (wrong machine, tampered data, or unsupported method).
    pub fn get_secret(&self, key: &str) -> Result<Option<String>> {
        if self.use_keyring {
            match keyring::Entry::new(KEYRING_SERVICE, key) {
                Ok(entry) => match entry.get_password() {
                    Ok(value) => return Ok(Some(value)),
                    Err(keyring::Error::NoEntry) => {}
                    Err(err) => {
                        debug!(key, %err, "keychain lookup failed, falling back to file");
                    }
                },
                Err(err) => debug!(key, %err, "keychain unavailable, falling back to file"),
            }
        }

        let entries = self.load_secure_entries()?;
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        self.decrypt_entry(key, entry).map(Some)
    }

    /// Store a secret: OS keychain plus the encrypted file fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the secure-settings file cannot be written.
    pub fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        if self.use_keyring {
            match keyring::Entry::new(KEYRING_SERVICE, key) {
                Ok(entry) => {
                    if let Err(err) = entry.set_password(value) {
                        warn!(key, %err, "keychain write failed, using encrypted file only");
                    }
                }
                Err(err) => warn!(key, %err, "keychain unavailable, using encrypted file only"),
            }
        }

        let mut entries = self.load_secure_entries()?;
        entries.insert(key.to_owned(), self.encrypt_value(key, value)?);
        self.save_secure_entries(&entries)
    }

    /// Remove a secret from both backends. Missing entries are not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the secure-settings file cannot be rewritten.
    pub fn delete_secret(&self, key: &str) -> Result<()> {
        if self.use_keyring {
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, key) {
                let _ = entry.delete_credential();
            }
        }
        let mut entries = self.load_secure_entries()?;
        if entries.remove(key).is_some() {
            self.save_secure_entries(&entries)?;
        }
        Ok(())
    }

    fn load_secure_entries(&self) -> Result<BTreeMap<String, SecureEntry>> {
        let path = self.data_dir.join(SECURE_SETTINGS_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_secure_entries(&self, entries: &BTreeMap<String, SecureEntry>) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(entries)?;
        atomic_write(&self.data_dir.join(SECURE_SETTINGS_FILE), json.as_bytes())
    }

    fn encrypt_value(&self, key: &str, value: &str) -> Result<SecureEntry> {
        use base64::Engine as _;

        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| AppError::CredentialsInvalid("bad machine key length".into()))?;
        let sealing = LessSafeKey::new(unbound);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| AppError::CredentialsInvalid("nonce generation failed".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = value.as_bytes().to_vec();
        sealing
            .seal_in_place_append_tag(nonce, Aad::from(key.as_bytes()), &mut in_out)
            .map_err(|_| AppError::CredentialsInvalid("encryption failed".into()))?;

        let mut packed = nonce_bytes.to_vec();
        packed.extend_from_slice(&in_out);

        Ok(SecureEntry {
            encrypted: true,
            method: "crypto".into(),
            data: base64::engine::general_purpose::STANDARD.encode(packed),
        })
    }

    fn decrypt_entry(&self, key: &str, entry: &SecureEntry) -> Result<String> {
        use base64::Engine as _;

        if entry.method != "crypto" {
            // "sodium" entries come from builds linking libsodium; the tag
            // keeps the failure explicit instead of producing garbage.
            return Err(AppError::CredentialsInvalid(format!(
                "unsupported secure-settings method '{}' for key '{key}'",
                entry.method
            )));
        }

        let packed = base64::engine::general_purpose::STANDARD
            .decode(&entry.data)
            .map_err(|err| AppError::CredentialsInvalid(format!("bad base64 for '{key}': {err}")))?;
        if packed.len() <= NONCE_LEN {
            return Err(AppError::CredentialsInvalid(format!("truncated ciphertext for '{key}'")));
        }

        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
        let mut nonce_arr = [0u8; NONCE_LEN];
        nonce_arr.copy_from_slice(nonce_bytes);

        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| AppError::CredentialsInvalid("bad machine key length".into()))?;
        let opening = LessSafeKey::new(unbound);

        let mut in_out = ciphertext.to_vec();
        let plain = opening
            .open_in_place(Nonce::assume_unique_for_key(nonce_arr), Aad::from(key.as_bytes()), &mut in_out)
            .map_err(|_| {
                AppError::CredentialsInvalid(format!("decryption failed for '{key}'"))
            })?;

        String::from_utf8(plain.to_vec())
            .map_err(|_| AppError::CredentialsInvalid(format!("non-UTF8 secret for '{key}'")))
    }
}

/// Strip trailing slashes from a server URL.
///
/// Applied when reading or materializing the agent home settings file; the
/// repair is local-only and never propagated to the account server.
#[must_use]
pub fn normalize_server_url(url: &str) -> String {
    url.trim_end_matches('/').to_owned()
}

/// Write a file atomically (tmp + rename).
///
/// # Errors
///
/// Returns `AppError::Io` if the write or rename fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
