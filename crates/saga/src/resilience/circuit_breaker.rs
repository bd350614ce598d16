//! Per-dependency circuit breaker.
//!
//! Three states: Closed (calls pass), Open (calls fail fast) and HalfOpen
//! (one probe call decides whether to close or reopen).

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use domain::Capability;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::CapabilityError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast until the cool-down elapses.
    Open,
    /// Letting one probe through to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// How long the circuit stays open before a probe is allowed.
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cool_down: Duration::from_secs(30),
        }
    }
}

/// Snapshot of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    recent_failures: VecDeque<Instant>,
    success_count: u64,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            success_count: 0,
            last_failure_time: None,
            opened_at: None,
            probe_started_at: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.recent_failures.front() {
            if now.duration_since(*oldest) > window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Guards calls to one dependency.
///
/// All counters sit behind a single mutex, so concurrent workers calling the
/// same dependency never lose an update.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        tracing::debug!(
            dependency = %name,
            failure_threshold = config.failure_threshold,
            cool_down_ms = config.cool_down.as_millis() as u64,
            "circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Runs `operation` if the circuit lets it through.
    ///
    /// Fails with [`CapabilityError::CircuitOpen`] without calling
    /// `operation` while the circuit is open or a half-open probe is already
    /// in flight.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, CapabilityError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        if !self.try_admit().await {
            metrics::counter!("circuit_breaker_rejected_total", "dependency" => self.name.clone())
                .increment(1);
            return Err(CapabilityError::CircuitOpen {
                dependency: self.name.clone(),
            });
        }

        let result = operation().await;
        match &result {
            Err(err) if err.is_dependency_fault() => self.record_failure().await,
            _ => self.record_success().await,
        }
        result
    }

    async fn try_admit(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| now.duration_since(at) >= self.config.cool_down);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started_at = Some(now);
                    tracing::info!(dependency = %self.name, "circuit half-open, probing");
                }
                cooled
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back (its caller was dropped)
                // frees the slot after another cool-down.
                let stale = inner
                    .probe_started_at
                    .is_none_or(|at| now.duration_since(at) >= self.config.cool_down);
                if stale {
                    inner.probe_started_at = Some(now);
                }
                stale
            }
        }
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.success_count += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.recent_failures.clear();
            inner.opened_at = None;
            inner.probe_started_at = None;
            tracing::info!(dependency = %self.name, "circuit closed");
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.recent_failures.push_back(now);
        inner.prune(now, self.config.failure_window);
        inner.last_failure_time = Some(Utc::now());

        let reopen = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                inner.recent_failures.len() >= self.config.failure_threshold as usize
            }
            CircuitState::Open => false,
        };

        if reopen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.probe_started_at = None;
            metrics::counter!("circuit_breaker_opened_total", "dependency" => self.name.clone())
                .increment(1);
            tracing::error!(
                dependency = %self.name,
                failure_count = inner.recent_failures.len(),
                "circuit opened"
            );
        }
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock().await;
        inner.prune(Instant::now(), self.config.failure_window);
        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.recent_failures.len() as u32,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
        }
    }
}

/// One breaker per capability, owned by the composition root.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    inventory: Arc<CircuitBreaker>,
    payment: Arc<CircuitBreaker>,
    notification: Arc<CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry with a breaker for every capability.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let breaker = |cap: Capability| Arc::new(CircuitBreaker::new(cap.as_str(), config.clone()));
        Self {
            inventory: breaker(Capability::Inventory),
            payment: breaker(Capability::Payment),
            notification: breaker(Capability::Notification),
        }
    }

    pub fn get(&self, capability: Capability) -> Arc<CircuitBreaker> {
        match capability {
            Capability::Inventory => self.inventory.clone(),
            Capability::Payment => self.payment.clone(),
            Capability::Notification => self.notification.clone(),
        }
    }

    /// Counters for every dependency, keyed by dependency name.
    pub async fn stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        let mut out = BTreeMap::new();
        for cap in Capability::ALL {
            out.insert(cap.as_str().to_string(), self.get(cap).stats().await);
        }
        out
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
