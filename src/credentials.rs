//! Terminal credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Environment variables take priority
//! over stored values so a terminal can be pointed at a staging dashboard
//! without touching the keyring.

use keyring::Entry;
use tracing::{info, warn};

use crate::error::{PosError, PosResult};
use crate::remote::normalize_admin_url;

const SERVICE_NAME: &str = "the-small-pos";

// Credential keys
const KEY_ADMIN_URL: &str = "admin_dashboard_url";
const KEY_TERMINAL_ID: &str = "terminal_id";
const KEY_API_KEY: &str = "pos_api_key";

const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_TERMINAL_ID, KEY_API_KEY];

/// Environment overrides, checked before the keyring.
const ENV_ADMIN_URL: &str = "POS_ADMIN_URL";
const ENV_TERMINAL_ID: &str = "POS_TERMINAL_ID";
const ENV_API_KEY: &str = "POS_API_KEY";

#[derive(Clone, PartialEq, Eq)]
pub struct TerminalCredentials {
    pub admin_url: String,
    pub terminal_id: String,
    pub api_key: String,
}

impl std::fmt::Debug for TerminalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalCredentials")
            .field("admin_url", &self.admin_url)
            .field("terminal_id", &self.terminal_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> PosResult<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| PosError::Config(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| PosError::Config(e.to_string()))
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> PosResult<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| PosError::Config(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(PosError::Config(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Combine environment and stored values. `None` unless admin URL, terminal
/// id and API key are all present and non-blank.
pub fn resolve_credentials(
    env: impl Fn(&str) -> Option<String>,
    stored: impl Fn(&str) -> Option<String>,
) -> Option<TerminalCredentials> {
    let pick = |env_key: &str, store_key: &str| {
        env(env_key)
            .or_else(|| stored(store_key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    Some(TerminalCredentials {
        admin_url: normalize_admin_url(&pick(ENV_ADMIN_URL, KEY_ADMIN_URL)?),
        terminal_id: pick(ENV_TERMINAL_ID, KEY_TERMINAL_ID)?,
        api_key: pick(ENV_API_KEY, KEY_API_KEY)?,
    })
}

/// Credentials from the process environment and the OS keyring.
pub fn load_credentials() -> Option<TerminalCredentials> {
    resolve_credentials(|key| std::env::var(key).ok(), get_credential)
}

/// Store terminal credentials received during onboarding.
pub fn store_credentials(credentials: &TerminalCredentials) -> PosResult<()> {
    let admin_url = normalize_admin_url(&credentials.admin_url);
    let terminal_id = credentials.terminal_id.trim();
    let api_key = credentials.api_key.trim();
    if terminal_id.is_empty() {
        return Err(PosError::Config("Missing required field: terminalId".into()));
    }
    if api_key.is_empty() {
        return Err(PosError::Config("Missing required field: apiKey".into()));
    }

    set_credential(KEY_ADMIN_URL, &admin_url)?;
    set_credential(KEY_TERMINAL_ID, terminal_id)?;
    set_credential(KEY_API_KEY, api_key)?;
    info!(terminal_id = %terminal_id, "terminal credentials updated");
    Ok(())
}

/// Delete every stored credential (factory reset).
pub fn clear_credentials() -> PosResult<()> {
    info!("performing factory reset – deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
