use thiserror::Error;

use crate::container::ContainerError;
use crate::store::StoreError;

/// Errors returned by a session runtime.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No bucket identifier; storage was cleared and nothing was started.
    #[error("session {0} has no bucket identifier")]
    Orphaned(String),

    #[error("session {0} has been destroyed")]
    Destroyed(String),

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("invalid bucket identifier: {0}")]
    InvalidIdentity(String),

    #[error("session {0} has no running container")]
    NotRunning(String),

    #[error("container did not become healthy: {0}")]
    StartFailed(String),

    #[error("container unreachable: {0}")]
    Unreachable(String),

    #[error("storage credentials misconfigured: {0}")]
    Credentials(String),

    #[error("session runtime {0} is no longer running")]
    Unavailable(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
