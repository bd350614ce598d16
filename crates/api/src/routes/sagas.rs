//! Saga start, status and cancellation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId};
use domain::{Money, OrderItem, OrderStatus, SagaInstance, SagaStatus, SagaStep, UserId};
use saga::{CancellationOutcome, StartSagaRequest};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::{AppState, AppStore};

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaBody {
    /// Generated when absent.
    pub correlation_id: Option<String>,
    pub order_id: Option<String>,
    pub user_id: Option<String>,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaStartedResponse {
    pub correlation_id: String,
    pub saga_id: String,
    pub status: SagaStatus,
    pub order_status: OrderStatus,
}

#[derive(Serialize)]
pub struct SagaResponse {
    pub correlation_id: String,
    pub saga_id: String,
    pub order_id: String,
    pub order_status: OrderStatus,
    pub status: SagaStatus,
    pub current_step: Option<SagaStep>,
    pub completed_steps: Vec<SagaStep>,
    pub compensated_steps: Vec<SagaStep>,
    pub retry_count: u32,
    pub total_cents: i64,
    pub payment_id: Option<String>,
    pub reservation_ids: Vec<String>,
    pub failure_reason: Option<String>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl From<&SagaInstance> for SagaResponse {
    fn from(saga: &SagaInstance) -> Self {
        let data = saga.saga_data();
        Self {
            correlation_id: saga.correlation_id().to_string(),
            saga_id: saga.id().to_string(),
            order_id: data.order_id.to_string(),
            order_status: OrderStatus::from(saga.status()),
            status: saga.status(),
            current_step: saga.current_step(),
            completed_steps: saga.completed_steps().to_vec(),
            compensated_steps: saga.compensated_steps().to_vec(),
            retry_count: saga.retry_count(),
            total_cents: data.total_amount().cents(),
            payment_id: data.payment_id.clone(),
            reservation_ids: data
                .reservations
                .iter()
                .map(|r| r.reservation_id.clone())
                .collect(),
            failure_reason: saga.failure_reason().map(String::from),
            last_error: saga.last_error().map(String::from),
            started_at: saga.started_at(),
            completed_at: saga.completed_at(),
            failed_at: saga.failed_at(),
        }
    }
}

#[derive(Serialize)]
pub struct CancellationResponse {
    pub correlation_id: String,
    /// `already_finished`, `applied` or `pending`.
    pub outcome: &'static str,
    pub status: Option<SagaStatus>,
}

// -- Handlers --

/// POST /sagas: create a saga for an order.
///
/// Returns 202: the saga runs once its start event reaches a worker.
#[tracing::instrument(skip(state, body))]
pub async fn start<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(body): Json<StartSagaBody>,
) -> Result<(StatusCode, Json<SagaStartedResponse>), ApiError> {
    let correlation_id = match body.correlation_id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiError::BadRequest(
                "correlation_id must not be blank".to_string(),
            ));
        }
        Some(id) => CorrelationId::new(id),
        None => CorrelationId::generate(),
    };
    let order_id = match body.order_id {
        Some(id) => AggregateId::from(parse_uuid("order_id", &id)?),
        None => AggregateId::new(),
    };
    let user_id = match body.user_id {
        Some(id) => UserId::from_uuid(parse_uuid("user_id", &id)?),
        None => UserId::new(),
    };
    let items = body
        .items
        .into_iter()
        .map(|item| {
            OrderItem::new(
                item.product_id,
                item.quantity,
                Money::from_cents(item.unit_price_cents),
            )
        })
        .collect();

    let saga = state
        .orchestrator
        .start_saga(StartSagaRequest {
            correlation_id,
            order_id,
            user_id,
            items,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SagaStartedResponse {
            correlation_id: saga.correlation_id().to_string(),
            saga_id: saga.id().to_string(),
            status: saga.status(),
            order_status: OrderStatus::from(saga.status()),
        }),
    ))
}

/// GET /sagas/:correlation_id: saga detail and the coarse order status.
#[tracing::instrument(skip(state))]
pub async fn get<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(correlation_id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga = state
        .orchestrator
        .get_saga(&CorrelationId::new(correlation_id.as_str()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {correlation_id} not found")))?;

    Ok(Json(SagaResponse::from(&saga)))
}

/// POST /sagas/:correlation_id/cancel: ask a saga to stop and undo its work.
#[tracing::instrument(skip(state))]
pub async fn cancel<S: AppStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(correlation_id): Path<String>,
) -> Result<Json<CancellationResponse>, ApiError> {
    let id = CorrelationId::new(correlation_id.as_str());
    let (outcome, status) = match state.orchestrator.request_cancellation(&id).await? {
        CancellationOutcome::AlreadyFinished(status) => ("already_finished", Some(status)),
        CancellationOutcome::Applied(status) => ("applied", Some(status)),
        CancellationOutcome::Pending => ("pending", None),
    };

    Ok(Json(CancellationResponse {
        correlation_id,
        outcome,
        status,
    }))
}

fn parse_uuid(field: &str, value: &str) -> Result<uuid::Uuid, ApiError> {
    uuid::Uuid::parse_str(value).map_err(|e| ApiError::BadRequest(format!("Invalid {field}: {e}")))
}
