//! Outbox inspection endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use domain::OutboxEvent;
use saga_store::OutboxStore;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::{AppState, AppStore};

const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ParkedQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct ParkedEventResponse {
    pub id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub correlation_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<OutboxEvent> for ParkedEventResponse {
    fn from(event: OutboxEvent) -> Self {
        Self {
            id: event.id.to_string(),
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id.to_string(),
            event_type: event.event_type,
            correlation_id: event.correlation_id.map(|c| c.to_string()),
            retry_count: event.retry_count,
            max_retries: event.max_retries,
            last_error: event.last_error,
            created_at: event.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct ParkedResponse {
    /// Unprocessed rows, parked ones included.
    pub pending_count: u64,
    pub parked: Vec<ParkedEventResponse>,
}

/// GET /outbox/parked: rows that used up their delivery attempts.
#[tracing::instrument(skip(state))]
pub async fn parked<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ParkedQuery>,
) -> Result<Json<ParkedResponse>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_LIMIT);
    let parked = state.store.parked(limit).await?;
    let pending_count = state.store.pending_count().await?;

    Ok(Json(ParkedResponse {
        pending_count,
        parked: parked.into_iter().map(ParkedEventResponse::from).collect(),
    }))
}
