//! Retry policy with exponential backoff.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry in milliseconds
    pub initial_ms: u64,
    /// Growth factor between retries
    pub multiplier: f64,
    /// Upper bound on a single delay in milliseconds
    pub max_ms: u64,
    /// Total attempts including the first one (0 = unlimited)
    pub max_attempts: u32,
}

impl Backoff {
    /// Create a new backoff policy
    #[must_use]
    pub fn new(initial_ms: u64, max_ms: u64, max_attempts: u32) -> Self {
        Self {
            initial_ms,
            multiplier: 2.0,
            max_ms,
            max_attempts,
        }
    }

    /// Policy with no delay, for tests
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_ms: 0,
            multiplier: 1.0,
            max_ms: 0,
            max_attempts,
        }
    }

    /// Set the multiplier
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_ms as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(100, 5_000, 5)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy is exhausted.
///
/// Only errors classified as transient by [`CoreError::is_transient`] are
/// retried; the last error is returned otherwise.
///
/// # Errors
///
/// Returns the first permanent error, or the last transient one once the
/// attempts run out
pub async fn retry_transient<T, F, Fut>(backoff: &Backoff, operation: &str, mut op: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && backoff.allows(attempt) => {
                let delay = backoff.delay_for(attempt);
                tracing::warn!(operation, attempt, error = %err, ?delay, "transient error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Map an exhausted transient error into `Unavailable` for callers that
/// only care whether the backend could be reached
#[must_use]
pub fn into_unavailable(service: &str, err: CoreError) -> CoreError {
    if err.is_transient() {
        CoreError::unavailable(service, err.to_string())
    } else {
        err
    }
}
