//! Fault isolation for capability calls.
//!
//! - [`CircuitBreaker`] stops calling a dependency that keeps failing
//! - [`RetryExecutor`] retries a call with exponential backoff and jitter
//!
//! Steps wrap the breaker inside the retry loop, so every attempt consults
//! the breaker and an open circuit ends the loop at once.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};
