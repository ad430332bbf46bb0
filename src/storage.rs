//! Document store credentials kept in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Operators usually
//! paste a single connection string: base64 (URL-safe or standard, padding
//! optional) of `{"url": "...", "key": "..."}`, or that JSON verbatim.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::remote::http::normalize_base_url;

const SERVICE_NAME: &str = "intervention-sync";

const KEY_STORE_URL: &str = "store_url";
const KEY_API_KEY: &str = "store_api_key";

/// Base URL and API key of the remote document store.
#[derive(Clone)]
pub struct StoreCredentials {
    pub base_url: String,
    pub api_key: Zeroizing<String>,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Keyring helpers
// ---------------------------------------------------------------------------

/// Read one credential. `None` when absent or when the platform store fails.
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

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())
}

/// Delete a credential. Succeeds if it does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Parse a connection string into credentials. Both `url` and `key` must be
/// present and non-empty.
pub fn parse_connection_string(raw: &str) -> Option<StoreCredentials> {
    let payload = decode_connection_string_payload(raw)?;
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let url = field("url")?;
    let key = field("key")?;
    Some(StoreCredentials {
        base_url: normalize_base_url(&url),
        api_key: Zeroizing::new(key),
    })
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Credentials stored in the keyring, if both entries exist.
pub fn load_credentials() -> Option<StoreCredentials> {
    let base_url = get_credential(KEY_STORE_URL)?;
    let api_key = Zeroizing::new(get_credential(KEY_API_KEY)?);
    Some(StoreCredentials { base_url, api_key })
}

/// Persist the credentials carried by a connection string.
pub fn save_connection_string(raw: &str) -> Result<StoreCredentials, String> {
    let credentials = parse_connection_string(raw)
        .ok_or("Invalid connection string: expected url and key")?;
    set_credential(KEY_STORE_URL, &credentials.base_url)?;
    set_credential(KEY_API_KEY, credentials.api_key.as_str())?;
    info!(base_url = %credentials.base_url, "Document store credentials saved");
    Ok(credentials)
}

/// Explicit connection string first, then the keyring.
pub fn resolve_credentials(connection_string: Option<&str>) -> Option<StoreCredentials> {
    if let Some(raw) = connection_string {
        match parse_connection_string(raw) {
            Some(credentials) => return Some(credentials),
            None => warn!("Ignoring unreadable connection string from configuration"),
        }
    }
    load_credentials()
}

pub fn clear_credentials() -> Result<(), String> {
    delete_credential(KEY_STORE_URL)?;
    delete_credential(KEY_API_KEY)?;
    info!("Document store credentials cleared");
    Ok(())
}
