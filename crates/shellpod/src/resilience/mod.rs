//! Retry and fail-fast primitives shared by health polling and the activity
//! monitor.

mod backoff;
mod circuit;

pub use backoff::{BackoffPolicy, RetryError, with_backoff};
pub use circuit::{BreakerConfig, BreakerStatus, CircuitBreaker, CircuitError};
