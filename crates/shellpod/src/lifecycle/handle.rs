use shellpod_protocol::{ActivitySnapshot, HealthPayload};
use tokio::sync::{mpsc, oneshot, watch};

use super::actor::{Command, Phase, StatusSnapshot};
use super::error::SessionError;

/// Cheap, cloneable address of one session runtime.
#[derive(Debug, Clone)]
pub struct ActorHandle {
    session_id: String,
    tx: mpsc::Sender<Command>,
    phase: watch::Receiver<Phase>,
}

impl ActorHandle {
    pub(crate) fn new(
        session_id: &str,
        tx: mpsc::Sender<Command>,
        phase: watch::Receiver<Phase>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            tx,
            phase,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The actor task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Phase as of the last request or wake-up the actor finished.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// The task has exited or the session was destroyed. Either way the
    /// next caller needs a fresh actor.
    pub fn is_retired(&self) -> bool {
        self.is_closed() || self.phase() == Phase::Destroyed
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Unavailable(self.session_id.clone()))?;
        rx.await
            .map_err(|_| SessionError::Unavailable(self.session_id.clone()))
    }

    /// Start the container if needed and wait until it answers `/health`.
    pub async fn ensure_started(&self) -> Result<StatusSnapshot, SessionError> {
        self.request(Command::EnsureStarted).await?
    }

    /// Associate a bucket with this session. Returns the stored value.
    pub async fn set_identity(&self, bucket: impl Into<String>) -> Result<String, SessionError> {
        let bucket = bucket.into();
        self.request(|reply| Command::SetIdentity { bucket, reply })
            .await?
    }

    pub async fn get_identity(&self) -> Result<Option<String>, SessionError> {
        self.request(Command::GetIdentity).await
    }

    /// Safe to call repeatedly.
    pub async fn destroy(&self) -> Result<(), SessionError> {
        self.request(Command::Destroy).await?
    }

    pub async fn status(&self) -> Result<StatusSnapshot, SessionError> {
        self.request(Command::Status).await
    }

    pub async fn health(&self) -> Result<HealthPayload, SessionError> {
        self.request(Command::Health).await?
    }

    pub async fn activity(&self) -> Result<ActivitySnapshot, SessionError> {
        self.request(Command::Activity).await?
    }

    /// Loopback `host:port` of the container agent, starting it if needed.
    pub async fn terminal_endpoint(&self) -> Result<String, SessionError> {
        self.request(Command::TerminalEndpoint).await?
    }
}
