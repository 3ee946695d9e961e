//! Storage credentials handed to every container.
//!
//! Resolved from the process environment first, then from the
//! `app_settings` table. Cached in memory by the caller, never written to
//! actor storage.

use std::fmt;
use std::sync::Arc;

use log::debug;

use super::error::SessionError;
use crate::store::SettingsRepository;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// (environment variable, settings key, container variable)
const FIELDS: [(&str, &str, &str); 4] = [
    ("SHELLPOD_STORAGE_ENDPOINT", "storage.endpoint", "STORAGE_ENDPOINT"),
    (
        "SHELLPOD_STORAGE_ACCESS_KEY_ID",
        "storage.access_key_id",
        "STORAGE_ACCESS_KEY_ID",
    ),
    (
        "SHELLPOD_STORAGE_SECRET_ACCESS_KEY",
        "storage.secret_access_key",
        "STORAGE_SECRET_ACCESS_KEY",
    ),
    ("SHELLPOD_STORAGE_ACCOUNT_ID", "storage.account_id", "STORAGE_ACCOUNT_ID"),
];

#[derive(Clone, PartialEq, Eq)]
pub struct StorageCredentials {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub account_id: String,
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl StorageCredentials {
    /// Container environment for these credentials.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let values = [
            &self.endpoint,
            &self.access_key_id,
            &self.secret_access_key,
            &self.account_id,
        ];
        FIELDS
            .iter()
            .zip(values)
            .map(|((_, _, var), value)| (var.to_string(), value.clone()))
            .collect()
    }
}

#[derive(Clone)]
pub struct CredentialResolver {
    settings: Option<SettingsRepository>,
    env: EnvLookup,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CredentialResolver {
    pub fn new(settings: Option<SettingsRepository>) -> Self {
        Self {
            settings,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replace the environment lookup.
    pub fn with_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(lookup);
        self
    }

    /// `Ok(None)` when nothing is configured; an error when only some fields are.
    pub async fn resolve(&self) -> Result<Option<StorageCredentials>, SessionError> {
        let mut values = Vec::with_capacity(FIELDS.len());
        let mut missing = Vec::new();

        for (env_name, settings_key, _) in FIELDS {
            let value = match (self.env)(env_name).filter(|v| !v.trim().is_empty()) {
                Some(value) => Some(value),
                None => self.setting(settings_key).await?,
            };
            if value.is_none() {
                missing.push(settings_key);
            }
            values.push(value.unwrap_or_default());
        }

        if missing.len() == FIELDS.len() {
            debug!("No storage credentials configured");
            return Ok(None);
        }
        if !missing.is_empty() {
            return Err(SessionError::Credentials(format!(
                "missing {}",
                missing.join(", ")
            )));
        }

        let mut values = values.into_iter();
        let mut next = || values.next().unwrap_or_default();
        Ok(Some(StorageCredentials {
            endpoint: next(),
            access_key_id: next(),
            secret_access_key: next(),
            account_id: next(),
        }))
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, SessionError> {
        let Some(ref settings) = self.settings else {
            return Ok(None);
        };
        settings
            .get(key)
            .await
            .map(|v| v.filter(|s| !s.trim().is_empty()))
            .map_err(|e| SessionError::Credentials(format!("reading {}: {:#}", key, e)))
    }
}
