use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry and settle timings for terminal connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Opens attempted before the first successful connect, including the first one.
    pub max_initial_attempts: u32,
    pub initial_retry_delay_ms: u64,
    /// Opens attempted after a lost connection or an exhausted initial phase.
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Pause between the first and second resize after connecting.
    pub settle_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_initial_attempts: 5,
            initial_retry_delay_ms: 1_000,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 3_000,
            settle_delay_ms: 150,
        }
    }
}

impl ManagerConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
