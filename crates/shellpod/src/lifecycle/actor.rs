//! The per-session actor.
//!
//! One task owns the state of one session. Requests come in through the
//! mailbox, the wake-up timer is a `sleep_until` branch of the same select,
//! so requests and wake-ups never interleave.
//!
//! Wake-up checks run in a fixed order and stop at the first verdict:
//! destroyed flag (storage only), orphan, container stopped, idle. The
//! status query is retried under `status_backoff`; every failure left after
//! that is a reason to destroy, never a reason to retry the timer.
//!
//! An orphaned or destroyed runtime with no pending wake-up exits once it has
//! seen no request for `dormant_grace`. The current phase is published on a
//! watch channel so the registry can replace destroyed runtimes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use shellpod_protocol::{ActivitySnapshot, HealthPayload};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::container_name;
use super::credentials::{CredentialResolver, StorageCredentials};
use super::error::SessionError;
use super::gate::ZombieGate;
use super::handle::ActorHandle;
use crate::activity::{ActivityMonitor, ActivityProbe, ActivityVerdict, is_idle};
use crate::config::{ContainerSettings, LifecycleConfig};
use crate::container::{ContainerConfig, ContainerRuntimeApi};
use crate::resilience::{CircuitBreaker, with_backoff};
use crate::store::DurableStore;

/// Everything an actor needs from the outside world.
#[derive(Clone)]
pub struct ActorDeps {
    pub store: Arc<dyn DurableStore>,
    pub runtime: Arc<dyn ContainerRuntimeApi>,
    pub probe: Arc<dyn ActivityProbe>,
    pub credentials: CredentialResolver,
    pub lifecycle: LifecycleConfig,
    pub container: ContainerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Uninitialized,
    /// No bucket identifier. Storage is empty and nothing runs.
    Orphan,
    /// Provisioned, container not known to be running.
    Active,
    Running,
    /// Container found stopped by a wake-up.
    Stopped,
    /// Container found idle by a wake-up.
    Idle,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestroyReason {
    Requested,
    Stopped,
    Idle,
    Unreachable,
    Error,
}

/// Read-only view returned by `status()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub session_id: String,
    pub phase: Phase,
    pub destroyed: bool,
    pub bucket_identifier: Option<String>,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub wakeup_scheduled: bool,
    pub next_wakeup_in_ms: Option<u64>,
    pub destroy_reason: Option<DestroyReason>,
}

pub(crate) enum Command {
    EnsureStarted(oneshot::Sender<Result<StatusSnapshot, SessionError>>),
    SetIdentity {
        bucket: String,
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    GetIdentity(oneshot::Sender<Option<String>>),
    Destroy(oneshot::Sender<Result<(), SessionError>>),
    Status(oneshot::Sender<StatusSnapshot>),
    Health(oneshot::Sender<Result<HealthPayload, SessionError>>),
    Activity(oneshot::Sender<Result<ActivitySnapshot, SessionError>>),
    TerminalEndpoint(oneshot::Sender<Result<String, SessionError>>),
}

pub(crate) struct SessionActor {
    session_id: String,
    container_name: String,
    gate: ZombieGate,
    runtime: Arc<dyn ContainerRuntimeApi>,
    status_breaker: CircuitBreaker,
    monitor: ActivityMonitor,
    credentials: CredentialResolver,
    cached_credentials: Option<Option<StorageCredentials>>,
    lifecycle: LifecycleConfig,
    container: ContainerSettings,

    phase: Phase,
    bucket: Option<String>,
    container_id: Option<String>,
    endpoint: Option<String>,
    next_wakeup: Option<Instant>,
    destroy_reason: Option<DestroyReason>,
    phase_tx: watch::Sender<Phase>,
}

impl SessionActor {
    pub(crate) fn new(session_id: &str, deps: ActorDeps) -> Self {
        Self {
            session_id: session_id.to_string(),
            container_name: container_name(session_id),
            gate: ZombieGate::new(deps.store, session_id),
            runtime: deps.runtime,
            status_breaker: CircuitBreaker::new(
                format!("{}/status", session_id),
                deps.lifecycle.breaker,
            ),
            monitor: ActivityMonitor::new(session_id, deps.probe, deps.lifecycle.breaker),
            credentials: deps.credentials,
            cached_credentials: None,
            lifecycle: deps.lifecycle,
            container: deps.container,
            phase: Phase::Uninitialized,
            bucket: None,
            container_id: None,
            endpoint: None,
            next_wakeup: None,
            destroy_reason: None,
            phase_tx: watch::channel(Phase::Uninitialized).0,
        }
    }

    /// Start the actor task. Initialization runs inside the task before the
    /// first request is read.
    pub(crate) fn spawn(session_id: &str, deps: ActorDeps) -> ActorHandle {
        let capacity = deps.lifecycle.mailbox_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let actor = Self::new(session_id, deps);
        let phase = actor.phase_tx.subscribe();
        tokio::spawn(actor.run(rx));
        ActorHandle::new(session_id, tx, phase)
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<Command>) {
        self.initialize().await;
        self.publish_phase();
        let mut last_event = Instant::now();

        loop {
            let wake_at = self.next_wakeup;
            let retire_at = self
                .is_dormant()
                .then(|| last_event + self.lifecycle.dormant_grace());
            tokio::select! {
                command = mailbox.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sleep_until(wake_at) => {
                    self.next_wakeup = None;
                    self.on_wakeup().await;
                }
                _ = sleep_until(retire_at) => {
                    debug!("Session runtime {} is dormant; exiting", self.session_id);
                    break;
                }
            }
            self.publish_phase();
            last_event = Instant::now();
        }

        debug!("Session runtime {} stopped ({:?})", self.session_id, self.phase);
    }

    /// Nothing left to do until a caller provisions the session again.
    fn is_dormant(&self) -> bool {
        matches!(self.phase, Phase::Orphan | Phase::Destroyed) && self.next_wakeup.is_none()
    }

    fn publish_phase(&self) {
        self.phase_tx.send_replace(self.phase);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::EnsureStarted(reply) => {
                let _ = reply.send(self.ensure_started().await);
            }
            Command::SetIdentity { bucket, reply } => {
                let _ = reply.send(self.set_identity(bucket).await);
            }
            Command::GetIdentity(reply) => {
                let _ = reply.send(self.bucket.clone());
            }
            Command::Destroy(reply) => {
                let _ = reply.send(self.destroy(DestroyReason::Requested).await);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Health(reply) => {
                let _ = reply.send(self.health().await);
            }
            Command::Activity(reply) => {
                let _ = reply.send(self.activity().await);
            }
            Command::TerminalEndpoint(reply) => {
                let result = match self.ensure_started().await {
                    Ok(_) => self
                        .endpoint
                        .clone()
                        .ok_or_else(|| SessionError::NotRunning(self.session_id.clone())),
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Load persisted state and pick the first phase.
    pub(crate) async fn initialize(&mut self) {
        match self.load().await {
            Ok(()) => {}
            Err(err) => {
                // Unreadable state cannot be trusted to hold a bucket.
                error!(
                    "Session runtime {} failed to load state: {}",
                    self.session_id, err
                );
                self.become_orphan().await;
            }
        }
    }

    async fn load(&mut self) -> Result<(), SessionError> {
        if self.gate.is_destroyed().await? {
            info!(
                "Session runtime {} was destroyed earlier; clearing storage",
                self.session_id
            );
            self.become_orphan().await;
            return Ok(());
        }

        let Some(bucket) = self.gate.bucket().await? else {
            info!(
                "Session runtime {} has no bucket identifier; clearing storage",
                self.session_id
            );
            self.become_orphan().await;
            return Ok(());
        };

        self.bucket = Some(bucket);
        self.container_id = self.gate.container_id().await?;
        self.phase = Phase::Active;
        self.resolve_credentials().await;

        let delay = match self.gate.alarm().await? {
            Some(fire_at) => (fire_at - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => self.lifecycle.poll_interval(),
        };
        self.arm_wakeup(delay).await;

        debug!(
            "Session runtime {} active (next wake-up in {:?})",
            self.session_id, delay
        );
        Ok(())
    }

    async fn become_orphan(&mut self) {
        if let Err(err) = self.gate.clear_all().await {
            error!(
                "Session runtime {} failed to clear storage: {}",
                self.session_id, err
            );
        }
        self.phase = Phase::Orphan;
        self.bucket = None;
        self.container_id = None;
        self.endpoint = None;
        self.next_wakeup = None;
    }

    async fn resolve_credentials(&mut self) -> Option<StorageCredentials> {
        if let Some(ref cached) = self.cached_credentials {
            return cached.clone();
        }
        match self.credentials.resolve().await {
            Ok(creds) => {
                self.cached_credentials = Some(creds.clone());
                creds
            }
            Err(err) => {
                warn!(
                    "Session runtime {}: storage credentials unavailable: {}",
                    self.session_id, err
                );
                None
            }
        }
    }

    /// Arm the wake-up unless one is already pending.
    async fn arm_wakeup(&mut self, delay: Duration) {
        if self.next_wakeup.is_some() {
            return;
        }
        self.next_wakeup = Some(Instant::now() + delay);
        let fire_at = chrono::Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(err) = self.gate.set_alarm(fire_at).await {
            // The in-memory timer still fires; only restart recovery is lost.
            warn!(
                "Session runtime {} failed to persist wake-up: {}",
                self.session_id, err
            );
        }
    }

    fn lifecycle_guard(&self) -> Result<(), SessionError> {
        match self.phase {
            Phase::Destroyed => Err(SessionError::Destroyed(self.session_id.clone())),
            Phase::Orphan | Phase::Uninitialized => {
                Err(SessionError::Orphaned(self.session_id.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn ensure_started(&mut self) -> Result<StatusSnapshot, SessionError> {
        self.lifecycle_guard()?;

        let state = self.runtime.container_state(&self.container_name).await?;
        match state {
            Some(state) if state.is_running() => {
                debug!(
                    "Session runtime {} container already running",
                    self.session_id
                );
            }
            Some(state) => {
                info!(
                    "Session runtime {} replacing {} container",
                    self.session_id, state
                );
                self.runtime
                    .remove_container(&self.container_name, true)
                    .await?;
                self.create_container().await?;
            }
            None => self.create_container().await?,
        }

        let endpoint = self.discover_endpoint().await?;
        self.wait_healthy(&endpoint).await?;

        self.phase = Phase::Running;
        self.arm_wakeup(self.lifecycle.poll_interval()).await;
        info!(
            "Session runtime {} running at {}",
            self.session_id, endpoint
        );
        Ok(self.status())
    }

    async fn create_container(&mut self) -> Result<(), SessionError> {
        let credentials = self.resolve_credentials().await;
        let bucket = self.bucket.clone().unwrap_or_default();

        let mut config = ContainerConfig::new(self.container.image.clone())
            .name(self.container_name.clone())
            .publish(self.container.container_port)
            .label("io.shellpod.session", self.session_id.clone())
            .envs(self.container.env.clone())
            .env("SHELLPOD_SESSION_ID", self.session_id.clone())
            .env("BUCKET_NAME", bucket);
        if let Some(creds) = credentials {
            config = config.envs(creds.to_env());
        }

        let id = self.runtime.create_container(&config).await?;
        info!(
            "Session runtime {} started container {}",
            self.session_id, id
        );
        self.endpoint = None;
        self.container_id = Some(id);
        self.gate
            .set_container_id(self.container_id.as_deref())
            .await?;
        Ok(())
    }

    async fn discover_endpoint(&mut self) -> Result<String, SessionError> {
        if let Some(ref endpoint) = self.endpoint {
            return Ok(endpoint.clone());
        }
        let endpoint = self
            .runtime
            .published_endpoint(&self.container_name, self.container.container_port)
            .await?
            .ok_or_else(|| SessionError::NotRunning(self.session_id.clone()))?;
        self.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn wait_healthy(&self, endpoint: &str) -> Result<HealthPayload, SessionError> {
        let monitor = &self.monitor;
        with_backoff(&self.lifecycle.start_backoff, |attempt| async move {
            debug!("Health check {} (attempt {})", endpoint, attempt);
            monitor.health_unguarded(endpoint).await
        })
        .await
        .map_err(|err| SessionError::StartFailed(err.to_string()))
    }

    async fn set_identity(&mut self, bucket: String) -> Result<String, SessionError> {
        let bucket = bucket.trim().to_string();
        if bucket.is_empty() {
            return Err(SessionError::InvalidIdentity(
                "bucket identifier must not be empty".to_string(),
            ));
        }
        if self.phase == Phase::Destroyed {
            return Err(SessionError::Destroyed(self.session_id.clone()));
        }

        match self.bucket.as_deref() {
            Some(current) if current == bucket => return Ok(bucket),
            Some(current) => warn!(
                "Session runtime {} bucket identifier changed from {} to {}",
                self.session_id, current, bucket
            ),
            None => info!(
                "Session runtime {} provisioned for bucket {}",
                self.session_id, bucket
            ),
        }

        self.gate.set_bucket(&bucket).await?;
        self.bucket = Some(bucket.clone());

        if self.phase == Phase::Orphan {
            self.phase = Phase::Active;
            self.resolve_credentials().await;
            self.arm_wakeup(self.lifecycle.poll_interval()).await;
        }
        Ok(bucket)
    }

    pub(crate) fn status(&self) -> StatusSnapshot {
        let now = Instant::now();
        StatusSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            destroyed: self.phase == Phase::Destroyed,
            bucket_identifier: self.bucket.clone(),
            container_id: self.container_id.clone(),
            endpoint: self.endpoint.clone(),
            wakeup_scheduled: self.next_wakeup.is_some(),
            next_wakeup_in_ms: self
                .next_wakeup
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            destroy_reason: self.destroy_reason,
        }
    }

    async fn health(&mut self) -> Result<HealthPayload, SessionError> {
        self.lifecycle_guard()?;
        let endpoint = self.discover_endpoint().await?;
        self.monitor
            .health(&endpoint)
            .await
            .map_err(|err| SessionError::Unreachable(err.to_string()))
    }

    async fn activity(&mut self) -> Result<ActivitySnapshot, SessionError> {
        self.lifecycle_guard()?;
        let endpoint = self.discover_endpoint().await?;
        match self.monitor.probe(&endpoint).await {
            ActivityVerdict::Snapshot(snapshot) => Ok(snapshot),
            ActivityVerdict::Unreachable(reason) => Err(SessionError::Unreachable(reason)),
        }
    }

    /// Wake-up handler.
    pub(crate) async fn on_wakeup(&mut self) {
        self.next_wakeup = None;

        // 1. Destroyed flag, storage only.
        match self.gate.is_destroyed().await {
            Ok(true) => {
                info!(
                    "Session runtime {} woke up destroyed; clearing storage",
                    self.session_id
                );
                if let Err(err) = self.gate.clear_all().await {
                    error!(
                        "Session runtime {} failed to clear storage: {}",
                        self.session_id, err
                    );
                }
                self.phase = Phase::Destroyed;
                return;
            }
            Ok(false) => {}
            Err(err) => {
                error!(
                    "Session runtime {} cannot read destroyed flag: {}",
                    self.session_id, err
                );
                self.destroy_quietly(DestroyReason::Error).await;
                return;
            }
        }

        // 2. Orphan.
        match self.gate.bucket().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(
                    "Session runtime {} woke up without a bucket identifier",
                    self.session_id
                );
                self.become_orphan().await;
                return;
            }
            Err(err) => {
                error!(
                    "Session runtime {} cannot read bucket identifier: {}",
                    self.session_id, err
                );
                self.destroy_quietly(DestroyReason::Error).await;
                return;
            }
        }

        // 3. Container stopped.
        let runtime = &self.runtime;
        let breaker = &self.status_breaker;
        let name = self.container_name.as_str();
        let state = with_backoff(&self.lifecycle.status_backoff, |attempt| async move {
            debug!("Status query {} (attempt {})", name, attempt);
            breaker.call(|| runtime.container_state(name)).await
        })
        .await;
        match state {
            Ok(Some(state)) if state.is_running() => {}
            Ok(state) => {
                info!(
                    "Session runtime {} container is {}; reclaiming",
                    self.session_id,
                    state.map(|s| s.to_string()).unwrap_or_else(|| "missing".to_string())
                );
                self.phase = Phase::Stopped;
                self.destroy_quietly(DestroyReason::Stopped).await;
                return;
            }
            Err(err) => {
                warn!(
                    "Session runtime {} status query failed: {}; reclaiming as idle",
                    self.session_id, err
                );
                self.phase = Phase::Idle;
                self.destroy_quietly(DestroyReason::Idle).await;
                return;
            }
        }

        // 4. Idle.
        let endpoint = match self.discover_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(
                    "Session runtime {} endpoint lookup failed: {}; reclaiming",
                    self.session_id, err
                );
                self.destroy_quietly(DestroyReason::Unreachable).await;
                return;
            }
        };

        match self.monitor.probe(&endpoint).await {
            ActivityVerdict::Snapshot(snapshot)
                if is_idle(&snapshot, self.lifecycle.idle_threshold()) =>
            {
                info!("Session runtime {} is idle; reclaiming", self.session_id);
                self.phase = Phase::Idle;
                self.destroy_quietly(DestroyReason::Idle).await;
            }
            ActivityVerdict::Snapshot(_) => {
                self.phase = Phase::Running;
                self.arm_wakeup(self.lifecycle.poll_interval()).await;
            }
            ActivityVerdict::Unreachable(reason) => {
                warn!(
                    "Session runtime {} activity unreachable: {}; reclaiming",
                    self.session_id, reason
                );
                self.destroy_quietly(DestroyReason::Unreachable).await;
            }
        }
    }

    async fn destroy_quietly(&mut self, reason: DestroyReason) {
        if let Err(err) = self.destroy(reason).await {
            error!(
                "Session runtime {} destroy failed: {}",
                self.session_id, err
            );
        }
    }

    /// Tombstone first, then timer, container and the rest of storage.
    async fn destroy(&mut self, reason: DestroyReason) -> Result<(), SessionError> {
        if self.phase == Phase::Destroyed {
            return Ok(());
        }
        let found_stopped = self.phase == Phase::Stopped;

        let marked = self.gate.mark_destroyed().await;
        self.phase = Phase::Destroyed;
        self.destroy_reason = Some(reason);
        self.next_wakeup = None;
        marked?;

        info!(
            "Destroying session runtime {} ({:?})",
            self.session_id, reason
        );

        if let Err(err) = self.gate.clear_alarm().await {
            warn!(
                "Session runtime {} failed to clear wake-up: {}",
                self.session_id, err
            );
        }

        if !found_stopped {
            let timeout = Some(self.container.stop_timeout_secs);
            if let Err(err) = self.runtime.stop_container(&self.container_name, timeout).await {
                debug!(
                    "Session runtime {} stop failed, removing anyway: {}",
                    self.session_id, err
                );
            }
        }

        if let Err(err) = self
            .runtime
            .remove_container(&self.container_name, true)
            .await
        {
            error!(
                "Session runtime {} failed to remove container: {}",
                self.session_id, err
            );
        }

        self.gate.purge_except_tombstone().await?;
        self.container_id = None;
        self.endpoint = None;
        Ok(())
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
