//! "Try N times with growing delay" executor.

use std::future::Future;
use std::time::Duration;

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry schedule for [`with_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay (before jitter).
    pub max_delay_ms: u64,
    /// Growth factor applied per failed attempt.
    pub factor: f64,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Scale each delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            factor: 2.0,
            max_attempts: 8,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay that follows the `attempt`-th failure (1-based), without jitter.
    ///
    /// `min(initial * factor^(attempt - 1), max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay_ms as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay that follows the `attempt`-th failure, with jitter when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let scale: f64 = rand::rng().random_range(0.5..=1.5);
        base.mul_f64(scale)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// All attempts failed. Carries the attempt count and the last failure.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        self.last_error
    }
}

/// Run `operation` until it succeeds or `policy.max_attempts` is reached.
///
/// The closure receives the 1-based attempt number.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts => {
                return Err(RetryError {
                    attempts: attempt,
                    last_error: err,
                });
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    "attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn fixed_policy() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            factor: 2.0,
            max_attempts: 6,
            jitter: false,
        }
    }

    #[test]
    fn base_delay_grows_then_caps() {
        let policy = fixed_policy();
        let delays: Vec<u128> = (1..=5).map(|n| policy.base_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
        assert_eq!(policy.base_delay(40).as_millis(), 1000);
    }

    #[test]
    fn jitter_stays_within_half_and_one_and_a_half() {
        let policy = BackoffPolicy {
            jitter: true,
            ..fixed_policy()
        };
        for _ in 0..200 {
            let delay = policy.delay_for(3).as_millis();
            assert!((200..=600).contains(&delay), "delay {delay} out of range");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_wait_the_capped_progression() {
        let calls: Arc<Mutex<Vec<Instant>>> = Arc::default();
        let recorder = calls.clone();

        let result = with_backoff(&fixed_policy(), move |attempt| {
            recorder.lock().unwrap().push(Instant::now());
            async move {
                if attempt <= 5 {
                    Err(format!("failure {attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 6);
        let calls = calls.lock().unwrap();
        let gaps: Vec<u128> = calls
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect();
        assert_eq!(gaps, vec![100, 200, 400, 800, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts_and_last_cause() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..fixed_policy()
        };
        let err = with_backoff(&policy, |attempt| async move {
            Err::<(), _>(format!("boom {attempt}"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "boom 3");
        assert_eq!(err.to_string(), "gave up after 3 attempt(s): boom 3");
    }

    #[tokio::test]
    async fn zero_max_attempts_still_tries_once() {
        let policy = BackoffPolicy {
            max_attempts: 0,
            ..fixed_policy()
        };
        let err = with_backoff(&policy, |_| async { Err::<(), _>("nope") })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }
}
