//! SQLite-backed durable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use super::{DurableStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(StoreError::InvalidAlarm(ms))
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, session_id: &str, key: &str) -> StoreResult<Option<Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM actor_storage WHERE session_id = ? AND key = ?")
                .bind(session_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(raw,)| {
            serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
    }

    async fn put(&self, session_id: &str, key: &str, value: Value) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO actor_storage (session_id, key, value, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT(session_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, session_id: &str, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM actor_storage WHERE session_id = ? AND key = ?")
            .bind(session_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_all(&self, session_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM actor_storage WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self, session_id: &str) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM actor_storage WHERE session_id = ? ORDER BY key")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn set_alarm(&self, session_id: &str, fire_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO actor_alarms (session_id, fire_at) VALUES (?, ?)
            ON CONFLICT(session_id) DO UPDATE SET fire_at = excluded.fire_at
            "#,
        )
        .bind(session_id)
        .bind(fire_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_alarm(&self, session_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT fire_at FROM actor_alarms WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(ms,)| from_millis(ms)).transpose()
    }

    async fn delete_alarm(&self, session_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM actor_alarms WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_alarms(&self) -> StoreResult<Vec<(String, DateTime<Utc>)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT session_id, fire_at FROM actor_alarms ORDER BY fire_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(id, ms)| Ok((id, from_millis(ms)?)))
            .collect()
    }
}
