//! Circuit breaker inspection endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::CircuitBreakerStats;

use crate::{AppState, AppStore};

/// GET /circuit-breakers: state and counters per dependency.
pub async fn list<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<BTreeMap<String, CircuitBreakerStats>> {
    Json(state.orchestrator.circuit_breaker_stats().await)
}
