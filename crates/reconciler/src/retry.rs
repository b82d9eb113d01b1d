//! Retry with exponential backoff and jitter for cluster-access calls.
//!
//! Only transient access errors are retried. The policy is bounded: the
//! attempt ceiling counts the first try, so a ceiling of 3 means at most
//! three calls.

use std::future::Future;
use std::time::Duration;

use keel_core::RolloutConfig;
use rand::Rng;
use tracing::{debug, error, warn};

use crate::error::AccessError;

/// Backoff policy for one cluster-access operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Result of a retried operation with the number of calls made.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, AccessError>,
    pub attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RolloutConfig) -> Self {
        Self {
            max_attempts: config.deploy_retry_ceiling.max(1),
            initial_delay: config.retry_backoff(),
            max_delay: config.max_retry_backoff(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before attempt `attempt` (1-based; the first attempt has none).
    /// Jitter spreads the exponential delay over 0.5x..1.5x.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(2)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::try_from_secs_f64(capped * jitter).unwrap_or(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or the ceiling
    /// is reached.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AccessError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                debug!(
                    operation = operation_name,
                    attempt,
                    delay = ?delay,
                    "Retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt, "Operation succeeded after retry"
                        );
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        remaining = max_attempts.saturating_sub(attempt),
                        error = %e,
                        "Transient cluster error"
                    );
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Retries exhausted"
                        );
                    } else {
                        warn!(operation = operation_name, error = %e, "Permanent cluster error");
                    }
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
