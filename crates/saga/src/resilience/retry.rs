//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::CapabilityError;

/// How often and how patiently to retry a call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform random delay added to each backoff.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Policy for forward steps: 3 attempts, 500ms doubling up to 10s.
    pub fn step_default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(100),
        }
    }

    /// Policy for compensating actions. More patient than steps, since
    /// giving up means an operator has to step in.
    pub fn compensation_default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(100),
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    /// Backoff before the `retry`-th retry (1-based), without jitter:
    /// `min(initial * multiplier^(retry - 1), max)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled.max(0.0))
        }
    }

    fn delay_with_jitter(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::step_default()
    }
}

/// What a retried call came to. Never an error itself; callers branch on it.
#[derive(Debug)]
pub struct RetryOutcome<T, E = CapabilityError> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub duration: Duration,
    /// True when every attempt failed with a retriable error.
    pub max_attempts_exceeded: bool,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs a call under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries `operation` while it fails with an error
    /// [`CapabilityError::is_retriable`] accepts.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        self.execute_with(CapabilityError::is_retriable, operation)
            .await
    }

    /// Retries `operation` while `is_retriable` accepts its error.
    pub async fn execute_with<F, Fut, T, E, C>(
        &self,
        is_retriable: C,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                tokio::time::sleep(self.policy.delay_with_jitter(attempt)).await;
                metrics::counter!("retry_attempts_total").increment(1);
            }
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        duration: started.elapsed(),
                        max_attempts_exceeded: false,
                    };
                }
                Err(err) => {
                    let retriable = is_retriable(&err);
                    if !retriable || attempt >= max_attempts {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                            duration: started.elapsed(),
                            max_attempts_exceeded: retriable,
                        };
                    }
                    tracing::debug!(attempt, max_attempts, error = %err, "attempt failed, retrying");
                }
            }
        }
    }
}
