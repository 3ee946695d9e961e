//! Application state shared across handlers.

use std::sync::Arc;

use crate::lifecycle::{ActorHandle, SessionRegistry};

use super::error::ApiResult;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Reported by `GET /health`.
    pub version: &'static str,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Actor handle for `session_id`, spawning it on first use.
    pub fn session(&self, session_id: &str) -> ApiResult<ActorHandle> {
        Ok(self.registry.get_or_spawn(session_id)?)
    }
}
