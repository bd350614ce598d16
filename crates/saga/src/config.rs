//! Orchestrator tuning.

use std::collections::HashMap;
use std::time::Duration;

use domain::SagaStep;

use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Settings for [`SagaOrchestrator`](crate::SagaOrchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retry policy for forward steps without an override.
    pub step_retry: RetryPolicy,
    pub step_policy_overrides: HashMap<SagaStep, RetryPolicy>,
    /// Upper bound for a single capability call.
    pub step_timeout: Duration,
    pub compensation_retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    /// How many times a saga may be parked in `RETRYING`.
    pub saga_max_retries: u32,
    pub saga_retry_delay: Duration,
    pub lease_duration: Duration,
    pub saga_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_retry: RetryPolicy::step_default(),
            step_policy_overrides: HashMap::new(),
            step_timeout: Duration::from_secs(30),
            compensation_retry: RetryPolicy::compensation_default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            saga_max_retries: 3,
            saga_retry_delay: Duration::from_secs(5),
            lease_duration: Duration::from_secs(5 * 60),
            saga_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl OrchestratorConfig {
    /// Retry policy used for `step`.
    pub fn policy_for(&self, step: SagaStep) -> &RetryPolicy {
        self.step_policy_overrides
            .get(&step)
            .unwrap_or(&self.step_retry)
    }

    pub fn with_step_policy(mut self, step: SagaStep, policy: RetryPolicy) -> Self {
        self.step_policy_overrides.insert(step, policy);
        self
    }
}

/// Converts to a chrono duration, saturating at one year.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
