//! In-memory durable store, used by tests and `--ephemeral` runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{DurableStore, StoreResult};

#[derive(Debug, Default)]
struct Inner {
    data: HashMap<String, BTreeMap<String, Value>>,
    alarms: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, session_id: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .lock()
            .data
            .get(session_id)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn put(&self, session_id: &str, key: &str, value: Value) -> StoreResult<()> {
        self.lock()
            .data
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, session_id: &str, key: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(ns) = inner.data.get_mut(session_id) {
            ns.remove(key);
            if ns.is_empty() {
                inner.data.remove(session_id);
            }
        }
        Ok(())
    }

    async fn delete_all(&self, session_id: &str) -> StoreResult<()> {
        self.lock().data.remove(session_id);
        Ok(())
    }

    async fn keys(&self, session_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()
            .data
            .get(session_id)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_alarm(&self, session_id: &str, fire_at: DateTime<Utc>) -> StoreResult<()> {
        self.lock().alarms.insert(session_id.to_string(), fire_at);
        Ok(())
    }

    async fn get_alarm(&self, session_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.lock().alarms.get(session_id).copied())
    }

    async fn delete_alarm(&self, session_id: &str) -> StoreResult<()> {
        self.lock().alarms.remove(session_id);
        Ok(())
    }

    async fn list_alarms(&self) -> StoreResult<Vec<(String, DateTime<Utc>)>> {
        let mut alarms: Vec<_> = self
            .lock()
            .alarms
            .iter()
            .map(|(id, at)| (id.clone(), *at))
            .collect();
        alarms.sort_by_key(|(_, at)| *at);
        Ok(alarms)
    }
}
