//! Durable per-session storage.
//!
//! Every session runtime owns a small key/value namespace plus at most one
//! pending wake-up alarm. Nothing else in the process writes to a session's
//! namespace.

mod memory;
mod settings;
mod sqlite;

pub use memory::MemoryStore;
pub use settings::SettingsRepository;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("stored value for '{key}' is not valid JSON: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stored alarm time {0} is out of range")]
    InvalidAlarm(i64),
}

/// Storage seam used by the session runtime and its zombie gate.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> StoreResult<Option<Value>>;
    async fn put(&self, session_id: &str, key: &str, value: Value) -> StoreResult<()>;
    async fn delete(&self, session_id: &str, key: &str) -> StoreResult<()>;
    /// Remove every key of the namespace. The alarm is left alone.
    async fn delete_all(&self, session_id: &str) -> StoreResult<()>;
    async fn keys(&self, session_id: &str) -> StoreResult<Vec<String>>;

    /// Replace the pending alarm.
    async fn set_alarm(&self, session_id: &str, fire_at: DateTime<Utc>) -> StoreResult<()>;
    async fn get_alarm(&self, session_id: &str) -> StoreResult<Option<DateTime<Utc>>>;
    async fn delete_alarm(&self, session_id: &str) -> StoreResult<()>;
    /// All pending alarms, earliest first.
    async fn list_alarms(&self) -> StoreResult<Vec<(String, DateTime<Utc>)>>;
}
