//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use outbox::RelayConfig;
use saga::{CircuitBreakerConfig, OrchestratorConfig};

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: Postgres connection string; in-memory store when unset
/// - `SAGA_WORKER_CONCURRENCY`: sagas executed at once (default 10)
/// - `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_BATCH_SIZE`: relay tuning
/// - `RECOVERY_SWEEP_INTERVAL_MS`: how often stalled sagas are resumed
/// - `CIRCUIT_FAILURE_THRESHOLD`, `CIRCUIT_COOL_DOWN_MS`: breaker tuning
/// - `STEP_TIMEOUT_MS`: upper bound for one capability call
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub saga_worker_concurrency: usize,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub recovery_sweep_interval: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_cool_down: Duration,
    pub step_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: parsed("PORT").unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parsed("LOG_FORMAT").unwrap_or(defaults.log_format),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            saga_worker_concurrency: parsed("SAGA_WORKER_CONCURRENCY")
                .unwrap_or(defaults.saga_worker_concurrency),
            outbox_poll_interval: millis("OUTBOX_POLL_INTERVAL_MS")
                .unwrap_or(defaults.outbox_poll_interval),
            outbox_batch_size: parsed("OUTBOX_BATCH_SIZE").unwrap_or(defaults.outbox_batch_size),
            recovery_sweep_interval: millis("RECOVERY_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.recovery_sweep_interval),
            circuit_failure_threshold: parsed("CIRCUIT_FAILURE_THRESHOLD")
                .unwrap_or(defaults.circuit_failure_threshold),
            circuit_cool_down: millis("CIRCUIT_COOL_DOWN_MS").unwrap_or(defaults.circuit_cool_down),
            step_timeout: millis("STEP_TIMEOUT_MS").unwrap_or(defaults.step_timeout),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Orchestrator settings with the overrides from this config applied.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            step_timeout: self.step_timeout,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.circuit_failure_threshold,
                cool_down: self.circuit_cool_down,
                ..CircuitBreakerConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            batch_size: self.outbox_batch_size,
            poll_interval: self.outbox_poll_interval,
            ..RelayConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        let relay = RelayConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            saga_worker_concurrency: 10,
            outbox_poll_interval: relay.poll_interval,
            outbox_batch_size: relay.batch_size,
            recovery_sweep_interval: Duration::from_secs(30),
            circuit_failure_threshold: orchestrator.circuit_breaker.failure_threshold,
            circuit_cool_down: orchestrator.circuit_breaker.cool_down,
            step_timeout: orchestrator.step_timeout,
        }
    }
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn millis(key: &str) -> Option<Duration> {
    parsed::<u64>(key).map(Duration::from_millis)
}
