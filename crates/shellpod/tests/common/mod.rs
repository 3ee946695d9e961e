//! Test utilities and common setup.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use axum::Router;
use shellpod::activity::{ActivityProbe, ProbeError};
use shellpod::api::{self, AppState};
use shellpod::config::{ContainerSettings, LifecycleConfig};
use shellpod::container::{ContainerConfig, ContainerResult, ContainerRuntimeApi, ContainerState};
use shellpod::lifecycle::{ActorDeps, CredentialResolver, SessionRegistry};
use shellpod::resilience::BackoffPolicy;
use shellpod::store::{DurableStore, MemoryStore};
use shellpod_protocol::{ActivitySnapshot, HealthPayload};

/// Container runtime that only tracks whether "the" container is up.
#[derive(Default)]
pub struct FakeRuntime {
    running: AtomicBool,
    pub created: AtomicU32,
    pub removed: AtomicU32,
}

impl FakeRuntime {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, _config: &ContainerConfig) -> ContainerResult<String> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok("c0ffee".to_string())
    }

    async fn container_state(&self, _name: &str) -> ContainerResult<Option<ContainerState>> {
        Ok(self.is_running().then_some(ContainerState::Running))
    }

    async fn published_endpoint(&self, _name: &str, _port: u16) -> ContainerResult<Option<String>> {
        Ok(self.is_running().then(|| "127.0.0.1:40000".to_string()))
    }

    async fn stop_container(&self, _name: &str, _timeout: Option<u32>) -> ContainerResult<()> {
        self.stop();
        Ok(())
    }

    async fn remove_container(&self, _name: &str, _force: bool) -> ContainerResult<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.stop();
        Ok(())
    }
}

/// Agent probe with a switchable health verdict. Activity always reports a
/// connected, busy terminal.
pub struct FakeProbe {
    healthy: AtomicBool,
}

impl FakeProbe {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl ActivityProbe for FakeProbe {
    async fn activity(&self, _endpoint: &str) -> Result<ActivitySnapshot, ProbeError> {
        Ok(ActivitySnapshot {
            has_active_connections: true,
            idle_since_pty_output_ms: 0,
            idle_since_socket_activity_ms: 0,
        })
    }

    async fn health(&self, _endpoint: &str) -> Result<HealthPayload, ProbeError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(HealthPayload {
                status: "ok".to_string(),
                cpu_percent: Some(1.5),
                memory_used_bytes: None,
                memory_total_bytes: None,
                uptime_secs: Some(3),
            })
        } else {
            Err(ProbeError::Unhealthy("booting".to_string()))
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<MemoryStore>,
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<FakeProbe>,
}

/// Lifecycle settings with a short start backoff so failing starts finish
/// quickly in real time.
pub fn test_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        start_backoff: BackoffPolicy {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            factor: 2.0,
            max_attempts: 3,
            jitter: false,
        },
        ..LifecycleConfig::default()
    }
}

pub fn test_deps(
    store: Arc<dyn DurableStore>,
    runtime: Arc<FakeRuntime>,
    probe: Arc<FakeProbe>,
) -> ActorDeps {
    ActorDeps {
        store,
        runtime,
        probe,
        credentials: CredentialResolver::new(None).with_env(|_| None),
        lifecycle: test_lifecycle(),
        container: ContainerSettings::default(),
    }
}

pub async fn test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(FakeRuntime::default());
    let probe = Arc::new(FakeProbe::default());
    let registry = Arc::new(SessionRegistry::new(test_deps(
        store.clone(),
        runtime.clone(),
        probe.clone(),
    )));
    let router = api::create_router(AppState::new(registry.clone()));

    TestApp {
        router,
        registry,
        store,
        runtime,
        probe,
    }
}
