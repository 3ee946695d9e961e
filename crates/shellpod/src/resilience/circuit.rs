//! Consecutive-failure circuit breaker.
//!
//! Closed counts consecutive failures. At the threshold it opens and rejects
//! every call without running it. Once the cooldown has elapsed a single
//! trial call is admitted (half-open); its outcome closes or re-opens the
//! breaker. Counters live in memory only and reset on restart.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a trial call.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The call was rejected without being attempted.
    #[error("circuit '{name}' is open")]
    Open { name: String },

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { since: Instant },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

enum Permit {
    Normal,
    Trial,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn status(&self) -> BreakerStatus {
        match *self.lock() {
            State::Closed { .. } => BreakerStatus::Closed,
            State::Open { until } if Instant::now() >= until => BreakerStatus::HalfOpen,
            State::Open { .. } => BreakerStatus::Open,
            State::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }

    /// Run `call` through the breaker.
    pub async fn call<T, E, F, Fut>(&self, call: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().ok_or_else(|| CircuitError::Open {
            name: self.name.clone(),
        })?;

        match call().await {
            Ok(value) => {
                self.on_success(permit);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(permit);
                Err(CircuitError::Inner(err))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // The state is plain data; a poisoned lock still holds a valid value.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self) -> Option<Permit> {
        let mut state = self.lock();
        let now = Instant::now();
        match *state {
            State::Closed { .. } => Some(Permit::Normal),
            State::Open { until } if now >= until => {
                *state = State::HalfOpen { since: now };
                Some(Permit::Trial)
            }
            State::Open { .. } => None,
            // A trial whose caller went away must not wedge the breaker.
            State::HalfOpen { since } if now >= since + self.config.cooldown() => {
                *state = State::HalfOpen { since: now };
                Some(Permit::Trial)
            }
            State::HalfOpen { .. } => None,
        }
    }

    fn on_success(&self, permit: Permit) {
        let mut state = self.lock();
        if matches!(permit, Permit::Trial) {
            info!("circuit '{}' closed after successful trial", self.name);
        }
        *state = State::Closed { failures: 0 };
    }

    fn on_failure(&self, permit: Permit) {
        let mut state = self.lock();
        let failures = match (*state, permit) {
            (_, Permit::Trial) => self.config.failure_threshold,
            (State::Closed { failures }, Permit::Normal) => failures.saturating_add(1),
            // Another caller already tripped it.
            (_, Permit::Normal) => return,
        };

        if failures >= self.config.failure_threshold {
            warn!(
                "circuit '{}' opened after {} consecutive failure(s); cooling down for {:?}",
                self.name,
                failures,
                self.config.cooldown()
            );
            *state = State::Open {
                until: Instant::now() + self.config.cooldown(),
            };
        } else {
            *state = State::Closed { failures };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 2,
                cooldown_ms: 1_000,
            },
        )
    }

    type Outcome = Result<(), CircuitError<&'static str>>;

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> Outcome {
        breaker
            .call(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicU32) -> Outcome {
        breaker
            .call(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_fails_fast() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);

        assert!(matches!(
            fail(&breaker, &calls).await,
            Err(CircuitError::Inner("down"))
        ));
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        assert!(matches!(
            fail(&breaker, &calls).await,
            Err(CircuitError::Inner("down"))
        ));
        assert_eq!(breaker.status(), BreakerStatus::Open);

        assert!(matches!(
            succeed(&breaker, &calls).await,
            Err(CircuitError::Open { .. })
        ));
        assert_eq!(
            calls.load(Ordering::SeqCst),
            2,
            "open breaker must not invoke the call"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);

        let _ = fail(&breaker, &calls).await;
        succeed(&breaker, &calls).await.unwrap();
        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_after_cooldown_closes_or_reopens() {
        let breaker = breaker();
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;
        let _ = fail(&breaker, &calls).await;

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);
        assert!(matches!(
            fail(&breaker, &calls).await,
            Err(CircuitError::Inner(_))
        ));
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }
}
