//! Session runtime lifecycle.
//!
//! Each session id is owned by one [`actor`](actor) task. Requests arrive
//! through an [`ActorHandle`]; the actor's own wake-up timer polls the
//! container and reclaims it when it stopped or went idle. Destruction goes
//! through the [`ZombieGate`] so a leftover timer can never bring a destroyed
//! runtime back.

mod actor;
mod credentials;
mod error;
mod gate;
mod handle;
mod registry;

pub use actor::{ActorDeps, DestroyReason, Phase, StatusSnapshot};
pub use credentials::{CredentialResolver, StorageCredentials};
pub use error::SessionError;
pub use gate::ZombieGate;
pub use handle::ActorHandle;
pub use registry::SessionRegistry;

/// Session ids end up in container names and storage keys.
pub fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidSessionId(session_id.to_string()))
    }
}

/// Container name for a session.
pub fn container_name(session_id: &str) -> String {
    format!("shellpod-{}", session_id)
}
