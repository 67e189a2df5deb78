//! Node credentials in the OS credential store.
//!
//! Windows DPAPI, macOS Keychain, Linux keyutils (via the `keyring` crate).
//! Only secrets and tenant identity live here; everything else is in the
//! `local_settings` table.

use keyring::Entry;
use tracing::{info, warn};

use crate::api;

const SERVICE_NAME: &str = "the-small-sync";

pub const KEY_TENANT_ID: &str = "tenant_id";
pub const KEY_API_KEY: &str = "pos_api_key";
pub const KEY_ADMIN_URL: &str = "admin_dashboard_url";
pub const KEY_COORDINATOR_URL: &str = "coordinator_url";

const ALL_KEYS: &[&str] = &[KEY_TENANT_ID, KEY_API_KEY, KEY_ADMIN_URL, KEY_COORDINATOR_URL];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// or the platform store is unavailable.
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
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Credentials handed to the node during provisioning.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub tenant_id: Option<String>,
    /// Plain key or a connection string carrying `key`, `url`, `tid`.
    pub api_key: String,
    pub admin_url: Option<String>,
    pub coordinator_url: Option<String>,
}

/// Resolved form of a [`CredentialUpdate`], ready to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub tenant_id: String,
    pub api_key: String,
    pub admin_url: Option<String>,
    pub coordinator_url: Option<String>,
}

impl CredentialUpdate {
    /// Unpack a connection string if one was given. Values decoded from the
    /// connection string win over the loose fields.
    pub fn resolve(&self) -> Result<ResolvedCredentials, String> {
        let raw = self.api_key.trim();
        let mut api_key = raw.to_string();
        let mut tenant_id = self
            .tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let mut admin_url = self.admin_url.clone();

        if let Some(decoded_key) = api::extract_api_key_from_connection_string(raw) {
            api_key = decoded_key;
            if let Some(tid) = api::extract_tenant_id_from_connection_string(raw) {
                tenant_id = Some(tid);
            }
            if let Some(url) = api::extract_admin_url_from_connection_string(raw) {
                admin_url = Some(url);
            }
        }

        if api_key.is_empty() {
            return Err("Missing required field: apiKey".to_string());
        }
        let tenant_id = tenant_id.ok_or("Missing required field: tenantId")?;

        Ok(ResolvedCredentials {
            tenant_id,
            api_key,
            admin_url: admin_url
                .map(|u| api::normalize_admin_url(&u))
                .filter(|u| !u.is_empty()),
            coordinator_url: self
                .coordinator_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
        })
    }
}

/// Persist provisioning credentials in the keyring.
pub fn store_credentials(update: &CredentialUpdate) -> Result<ResolvedCredentials, String> {
    let resolved = update.resolve()?;
    set_credential(KEY_TENANT_ID, &resolved.tenant_id)?;
    set_credential(KEY_API_KEY, &resolved.api_key)?;
    if let Some(url) = &resolved.admin_url {
        set_credential(KEY_ADMIN_URL, url)?;
    }
    if let Some(url) = &resolved.coordinator_url {
        set_credential(KEY_COORDINATOR_URL, url)?;
    }
    info!(tenant_id = %resolved.tenant_id, "node credentials updated");
    Ok(resolved)
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<(), String> {
    info!("performing factory reset - deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
