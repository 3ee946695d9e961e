//! Persisted lifecycle flags.
//!
//! The destroyed flag is the tombstone. It is written before any teardown
//! side effect and read with no resource interaction at the top of every
//! wake-up.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::store::{DurableStore, StoreResult};

pub(crate) const DESTROYED_KEY: &str = "destroyed";
pub(crate) const BUCKET_KEY: &str = "bucketIdentifier";
pub(crate) const CONTAINER_KEY: &str = "containerId";

#[derive(Clone)]
pub struct ZombieGate {
    store: Arc<dyn DurableStore>,
    session_id: String,
}

impl ZombieGate {
    pub fn new(store: Arc<dyn DurableStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
        }
    }

    /// Storage-only read.
    pub async fn is_destroyed(&self) -> StoreResult<bool> {
        let value = self.store.get(&self.session_id, DESTROYED_KEY).await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    pub async fn mark_destroyed(&self) -> StoreResult<()> {
        self.store
            .put(&self.session_id, DESTROYED_KEY, Value::Bool(true))
            .await
    }

    pub async fn bucket(&self) -> StoreResult<Option<String>> {
        self.string(BUCKET_KEY).await
    }

    pub async fn set_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.store
            .put(&self.session_id, BUCKET_KEY, Value::from(bucket))
            .await
    }

    pub async fn container_id(&self) -> StoreResult<Option<String>> {
        self.string(CONTAINER_KEY).await
    }

    pub async fn set_container_id(&self, id: Option<&str>) -> StoreResult<()> {
        match id {
            Some(id) => {
                self.store
                    .put(&self.session_id, CONTAINER_KEY, Value::from(id))
                    .await
            }
            None => self.store.delete(&self.session_id, CONTAINER_KEY).await,
        }
    }

    pub async fn alarm(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.store.get_alarm(&self.session_id).await
    }

    pub async fn set_alarm(&self, fire_at: DateTime<Utc>) -> StoreResult<()> {
        self.store.set_alarm(&self.session_id, fire_at).await
    }

    pub async fn clear_alarm(&self) -> StoreResult<()> {
        self.store.delete_alarm(&self.session_id).await
    }

    /// Drop every key and the alarm, tombstone included.
    pub async fn clear_all(&self) -> StoreResult<()> {
        self.store.delete_alarm(&self.session_id).await?;
        self.store.delete_all(&self.session_id).await
    }

    /// Drop everything except the destroyed flag.
    pub async fn purge_except_tombstone(&self) -> StoreResult<()> {
        self.store.delete_alarm(&self.session_id).await?;
        for key in self.store.keys(&self.session_id).await? {
            if key != DESTROYED_KEY {
                self.store.delete(&self.session_id, &key).await?;
            }
        }
        Ok(())
    }

    async fn string(&self, key: &str) -> StoreResult<Option<String>> {
        let value = self.store.get(&self.session_id, key).await?;
        Ok(value
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn purge_keeps_only_the_tombstone() {
        let store = Arc::new(MemoryStore::new());
        let gate = ZombieGate::new(store.clone(), "s1");
        gate.set_bucket("tenant").await.unwrap();
        gate.set_container_id(Some("abc123")).await.unwrap();
        gate.set_alarm(Utc::now()).await.unwrap();

        gate.mark_destroyed().await.unwrap();
        gate.purge_except_tombstone().await.unwrap();

        assert!(gate.is_destroyed().await.unwrap());
        assert_eq!(store.keys("s1").await.unwrap(), vec![DESTROYED_KEY]);
        assert_eq!(gate.alarm().await.unwrap(), None);
        assert_eq!(gate.bucket().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_bucket_reads_as_missing() {
        let store = Arc::new(MemoryStore::new());
        store.put("s1", BUCKET_KEY, Value::from("")).await.unwrap();
        let gate = ZombieGate::new(store, "s1");
        assert_eq!(gate.bucket().await.unwrap(), None);
        assert!(!gate.is_destroyed().await.unwrap());
    }
}
