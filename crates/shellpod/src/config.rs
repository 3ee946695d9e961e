//! Application configuration.
//!
//! Loaded by the binary from defaults, the TOML config file and
//! `SHELLPOD__SECTION__KEY` environment variables, in that order.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellpod_term::ManagerConfig;

use crate::container::{ContainerRuntime, RuntimeType};
use crate::resilience::{BackoffPolicy, BreakerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub container: ContainerSettings,
    pub lifecycle: LifecycleConfig,
    /// Terminal client timings used by `shellpod attach`.
    pub terminal: ManagerConfig,
    pub attach: AttachConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
    /// Database file; defaults to `<data_dir>/shellpod.db`.
    pub database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    pub runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    pub binary: Option<String>,
    /// Image every session runtime is started from
    pub image: String,
    /// Port of the in-container agent (health, activity, terminal socket)
    pub container_port: u16,
    /// Grace period of `stop` before a reclaimed container is removed
    pub stop_timeout_secs: u32,
    /// Extra environment passed to every container
    pub env: BTreeMap<String, String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "shellpod-sandbox:latest".to_string(),
            container_port: 7681,
            stop_timeout_secs: 10,
            env: BTreeMap::new(),
        }
    }
}

impl ContainerSettings {
    pub fn build_runtime(&self) -> ContainerRuntime {
        match (self.runtime, self.binary.as_ref()) {
            (Some(rt), Some(binary)) => ContainerRuntime::with_binary(rt, binary.clone()),
            (Some(rt), None) => ContainerRuntime::with_type(rt),
            (None, Some(binary)) => {
                let rt = if binary.contains("docker") {
                    RuntimeType::Docker
                } else {
                    RuntimeType::Podman
                };
                ContainerRuntime::with_binary(rt, binary.clone())
            }
            (None, None) => ContainerRuntime::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Interval of the recurring wake-up while a runtime is running.
    pub poll_interval_secs: u64,
    /// Both idle durations must reach this before the runtime is reclaimed.
    pub idle_threshold_secs: u64,
    /// Per-request timeout of health checks.
    pub health_timeout_ms: u64,
    /// Per-request timeout of activity queries.
    pub activity_timeout_ms: u64,
    /// Retry schedule while waiting for a fresh container to answer `/health`.
    pub start_backoff: BackoffPolicy,
    /// Retry schedule of the container status query run by each wake-up.
    pub status_backoff: BackoffPolicy,
    pub breaker: BreakerConfig,
    /// Mailbox depth of each session runtime.
    pub mailbox_capacity: usize,
    /// How long an orphaned or destroyed runtime keeps its task after the
    /// last request before it exits.
    pub dormant_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            idle_threshold_secs: 20 * 60,
            health_timeout_ms: 2_000,
            activity_timeout_ms: 2_000,
            start_backoff: BackoffPolicy::default(),
            status_backoff: BackoffPolicy {
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                factor: 2.0,
                max_attempts: 3,
                jitter: true,
            },
            breaker: BreakerConfig::default(),
            mailbox_capacity: 32,
            dormant_grace_secs: 5 * 60,
        }
    }
}

impl LifecycleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn dormant_grace(&self) -> Duration {
        Duration::from_secs(self.dormant_grace_secs)
    }
}

/// Socket settings of `shellpod attach`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Server base URL; defaults to the configured listen address.
    pub server: Option<String>,
    /// Buffered frames per direction of each terminal socket.
    pub outgoing_buffer: usize,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            server: None,
            outgoing_buffer: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [lifecycle]
            idle_threshold_secs = 300

            [terminal]
            max_reconnect_attempts = 1

            [attach]
            outgoing_buffer = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.lifecycle.idle_threshold(), Duration::from_secs(300));
        assert_eq!(config.lifecycle.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.terminal.max_reconnect_attempts, 1);
        assert_eq!(config.terminal.max_initial_attempts, 5);
        assert_eq!(config.attach.outgoing_buffer, 8);
        assert!(config.attach.server.is_none());
        assert_eq!(config.lifecycle.status_backoff.max_attempts, 3);
        assert_eq!(config.container.container_port, 7681);
    }

    #[test]
    fn default_config_serializes_to_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(text.contains("[lifecycle.start_backoff]"));
        assert!(text.contains("[lifecycle.status_backoff]"));
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.server.port, 8787);
        assert_eq!(back.attach.outgoing_buffer, 256);
        assert_eq!(back.terminal.settle_delay_ms, 150);
    }
}
