//! Activity and health queries against a running container.
//!
//! The in-container agent answers `GET /activity` with an
//! [`ActivitySnapshot`] and `GET /health` with a [`HealthPayload`]. Queries
//! are never retried here; each session's [`ActivityMonitor`] wraps them in
//! its own circuit breakers so a hung agent fails fast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use shellpod_protocol::{ActivitySnapshot, HealthPayload};
use thiserror::Error;

use crate::resilience::{BreakerConfig, BreakerStatus, CircuitBreaker, CircuitError};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("container reported status '{0}'")]
    Unhealthy(String),
}

/// Outcome of one activity query.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityVerdict {
    Snapshot(ActivitySnapshot),
    /// No usable answer. Treated like a stopped resource by the caller.
    Unreachable(String),
}

/// HTTP seam to the in-container agent.
#[async_trait]
pub trait ActivityProbe: Send + Sync {
    async fn activity(&self, endpoint: &str) -> Result<ActivitySnapshot, ProbeError>;
    async fn health(&self, endpoint: &str) -> Result<HealthPayload, ProbeError>;
}

/// `reqwest` implementation of [`ActivityProbe`].
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    activity_timeout: Duration,
    health_timeout: Duration,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, activity_timeout: Duration, health_timeout: Duration) -> Self {
        Self {
            client,
            activity_timeout,
            health_timeout,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        timeout: Duration,
    ) -> Result<T, ProbeError> {
        let request_error = |e: reqwest::Error| ProbeError::Request {
            url: url.clone(),
            message: e.to_string(),
        };

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(ProbeError::Status {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }

        response.json::<T>().await.map_err(request_error)
    }
}

#[async_trait]
impl ActivityProbe for HttpProbe {
    async fn activity(&self, endpoint: &str) -> Result<ActivitySnapshot, ProbeError> {
        let url = format!("http://{}/activity", endpoint);
        self.get_json(url, self.activity_timeout).await
    }

    async fn health(&self, endpoint: &str) -> Result<HealthPayload, ProbeError> {
        let url = format!("http://{}/health", endpoint);
        let payload: HealthPayload = self.get_json(url, self.health_timeout).await?;
        if !payload.is_healthy() {
            return Err(ProbeError::Unhealthy(payload.status));
        }
        Ok(payload)
    }
}

/// Per-session view of the agent, with one breaker per query kind.
pub struct ActivityMonitor {
    probe: Arc<dyn ActivityProbe>,
    activity_breaker: CircuitBreaker,
    health_breaker: CircuitBreaker,
}

impl ActivityMonitor {
    pub fn new(session_id: &str, probe: Arc<dyn ActivityProbe>, breaker: BreakerConfig) -> Self {
        Self {
            probe,
            activity_breaker: CircuitBreaker::new(format!("{}/activity", session_id), breaker),
            health_breaker: CircuitBreaker::new(format!("{}/health", session_id), breaker),
        }
    }

    /// One activity query. Never cached.
    pub async fn probe(&self, endpoint: &str) -> ActivityVerdict {
        match self
            .activity_breaker
            .call(|| self.probe.activity(endpoint))
            .await
        {
            Ok(snapshot) => ActivityVerdict::Snapshot(snapshot),
            Err(err) => {
                debug!("Activity query to {} failed: {}", endpoint, err);
                ActivityVerdict::Unreachable(err.to_string())
            }
        }
    }

    pub async fn health(&self, endpoint: &str) -> Result<HealthPayload, CircuitError<ProbeError>> {
        self.health_breaker
            .call(|| self.probe.health(endpoint))
            .await
    }

    /// Health check that bypasses the breaker, for start-up polling where
    /// failures are expected.
    pub async fn health_unguarded(&self, endpoint: &str) -> Result<HealthPayload, ProbeError> {
        self.probe.health(endpoint).await
    }

    pub fn breaker_status(&self) -> (BreakerStatus, BreakerStatus) {
        (self.activity_breaker.status(), self.health_breaker.status())
    }
}

/// Idle when nothing is attached and both idle durations reached `threshold`.
pub fn is_idle(snapshot: &ActivitySnapshot, threshold: Duration) -> bool {
    let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
    !snapshot.has_active_connections
        && snapshot.idle_since_pty_output_ms >= threshold_ms
        && snapshot.idle_since_socket_activity_ms >= threshold_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn snapshot(active: bool, pty: u64, socket: u64) -> ActivitySnapshot {
        ActivitySnapshot {
            has_active_connections: active,
            idle_since_pty_output_ms: pty,
            idle_since_socket_activity_ms: socket,
        }
    }

    #[test]
    fn idle_boundary_is_inclusive() {
        let threshold = Duration::from_secs(60);
        assert!(!is_idle(&snapshot(false, 59_999, 60_000), threshold));
        assert!(!is_idle(&snapshot(false, 60_000, 59_999), threshold));
        assert!(is_idle(&snapshot(false, 60_000, 60_000), threshold));
        assert!(!is_idle(&snapshot(true, 600_000, 600_000), threshold));
    }

    struct DeadProbe {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActivityProbe for DeadProbe {
        async fn activity(&self, endpoint: &str) -> Result<ActivitySnapshot, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProbeError::Request {
                url: endpoint.to_string(),
                message: "connection refused".to_string(),
            })
        }

        async fn health(&self, _endpoint: &str) -> Result<HealthPayload, ProbeError> {
            Err(ProbeError::Unhealthy("starting".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_stops_hammering_a_dead_agent() {
        let probe = Arc::new(DeadProbe {
            calls: AtomicU32::new(0),
        });
        let monitor = ActivityMonitor::new(
            "s1",
            probe.clone(),
            BreakerConfig {
                failure_threshold: 2,
                cooldown_ms: 1_000,
            },
        );

        for _ in 0..5 {
            assert!(matches!(
                monitor.probe("127.0.0.1:1").await,
                ActivityVerdict::Unreachable(_)
            ));
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.breaker_status().0, BreakerStatus::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        monitor.probe("127.0.0.1:1").await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }
}
