//! Session id to actor mapping.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};

use super::actor::{ActorDeps, SessionActor};
use super::error::SessionError;
use super::handle::ActorHandle;
use super::validate_session_id;
use crate::store::StoreError;

pub struct SessionRegistry {
    deps: ActorDeps,
    actors: DashMap<String, ActorHandle>,
}

impl SessionRegistry {
    pub fn new(deps: ActorDeps) -> Self {
        Self {
            deps,
            actors: DashMap::new(),
        }
    }

    /// Handle for `session_id`. A missing, exited or destroyed actor is
    /// replaced by a fresh one, which reads the persisted state again.
    pub fn get_or_spawn(&self, session_id: &str) -> Result<ActorHandle, SessionError> {
        validate_session_id(session_id)?;

        let handle = match self.actors.entry(session_id.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_retired() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                let handle = SessionActor::spawn(session_id, self.deps.clone());
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = SessionActor::spawn(session_id, self.deps.clone());
                entry.insert(handle.clone());
                handle
            }
        };
        Ok(handle)
    }

    /// Handle for `session_id` only if an actor already exists.
    pub fn get(&self, session_id: &str) -> Option<ActorHandle> {
        self.actors
            .get(session_id)
            .map(|h| h.clone())
            .filter(|h| !h.is_closed())
    }

    /// Spawn an actor for every session with a persisted wake-up, so timers
    /// survive a restart.
    pub async fn rehydrate(&self) -> Result<usize, StoreError> {
        let alarms = self.deps.store.list_alarms().await?;
        let mut spawned = 0;
        for (session_id, fire_at) in alarms {
            match self.get_or_spawn(&session_id) {
                Ok(_) => {
                    spawned += 1;
                    info!("Rehydrated session runtime {} (wake-up at {})", session_id, fire_at);
                }
                Err(err) => {
                    warn!("Skipping persisted wake-up for {}: {}", session_id, err);
                    self.deps.store.delete_alarm(&session_id).await?;
                }
            }
        }
        Ok(spawned)
    }

    /// Forget the handle for `session_id`. The actor task ends once the last
    /// outstanding handle is dropped; the next caller gets a fresh actor that
    /// reads the persisted state again.
    pub fn evict(&self, session_id: &str) -> bool {
        self.actors.remove(session_id).is_some()
    }

    /// Drop handles of exited or destroyed actors. Returns how many went.
    pub fn reap(&self) -> usize {
        let before = self.actors.len();
        self.actors.retain(|_, handle| !handle.is_retired());
        let reaped = before.saturating_sub(self.actors.len());
        if reaped > 0 {
            debug!("Reaped {} dormant session runtime(s)", reaped);
        }
        reaped
    }

    /// Reap once per `dormant_grace` for as long as the registry lives.
    pub fn start_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.deps.lifecycle.dormant_grace().max(std::time::Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.reap();
            }
        });
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.actors.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Drop every handle. Actor tasks end once in-flight requests finish;
    /// persisted wake-ups are kept for the next start.
    pub fn shutdown(&self) {
        let count = self.actors.len();
        self.actors.clear();
        info!("Released {} session runtime(s)", count);
    }
}
