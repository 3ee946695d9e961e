//! Telemetry reported by the container's terminal server.

use serde::{Deserialize, Serialize};

/// One activity reading. Produced fresh per poll, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    pub has_active_connections: bool,
    pub idle_since_pty_output_ms: u64,
    pub idle_since_socket_activity_ms: u64,
}

/// Payload of the container `/health` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

impl HealthPayload {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "healthy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_camel_case_json() {
        let snap: ActivitySnapshot = serde_json::from_str(
            r#"{"hasActiveConnections":false,"idleSincePtyOutputMs":1200,"idleSinceSocketActivityMs":900}"#,
        )
        .unwrap();
        assert!(!snap.has_active_connections);
        assert_eq!(snap.idle_since_pty_output_ms, 1200);
        assert_eq!(snap.idle_since_socket_activity_ms, 900);
    }

    #[test]
    fn health_optional_fields_may_be_absent() {
        let health: HealthPayload = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert!(health.is_healthy());
        assert!(health.cpu_percent.is_none());

        let degraded: HealthPayload =
            serde_json::from_str(r#"{"status":"degraded","cpuPercent":97.5}"#).unwrap();
        assert!(!degraded.is_healthy());
        assert_eq!(degraded.cpu_percent, Some(97.5));
    }
}
