//! Integration tests for the API server.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use api::AppState;
use api::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{AggregateId, CorrelationId, IdempotencyKey};
use domain::NewOutboxEvent;
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{InMemoryJobDispatcher, OutboxRelay, SAGA_QUEUE};
use saga::{Fault, SagaWorkerPool};
use saga_store::{InMemorySagaStore, OutboxStore};
use tokio::sync::watch;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup_with_state() -> (axum::Router, Arc<AppState<InMemorySagaStore>>) {
    let state = api::create_default_state(InMemorySagaStore::new(), &Config::default());
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn setup() -> axum::Router {
    setup_with_state().0
}

fn order_body(correlation_id: &str) -> serde_json::Value {
    serde_json::json!({
        "correlation_id": correlation_id,
        "items": [
            { "product_id": "P1", "quantity": 2, "unit_price_cents": 1000 },
            { "product_id": "P2", "quantity": 1, "unit_price_cents": 2500 }
        ]
    })
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let (status, json) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_start_saga_accepted() {
    let (app, state) = setup_with_state();

    let (status, json) = send(&app, post_json("/sagas", &order_body("api-start-1"))).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["correlation_id"], "api-start-1");
    assert_eq!(json["status"], "STARTED");
    assert_eq!(json["order_status"], "pending");

    // The start request travels through the outbox.
    assert_eq!(state.store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_start_saga_generates_correlation_id() {
    let app = setup();
    let body = serde_json::json!({
        "items": [{ "product_id": "P1", "quantity": 1, "unit_price_cents": 500 }]
    });

    let (status, json) = send(&app, post_json("/sagas", &body)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(!json["correlation_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_start_saga_rejects_empty_order() {
    let app = setup();
    let body = serde_json::json!({ "correlation_id": "api-empty", "items": [] });

    let (status, json) = send(&app, post_json("/sagas", &body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("no items"));
}

#[tokio::test]
async fn test_start_saga_rejects_bad_order_id() {
    let app = setup();
    let mut body = order_body("api-bad-id");
    body["order_id"] = serde_json::json!("not-a-uuid");

    let (status, _) = send(&app, post_json("/sagas", &body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_duplicate_correlation_id_conflicts() {
    let app = setup();

    let (first, _) = send(&app, post_json("/sagas", &order_body("api-dup"))).await;
    let (second, json) = send(&app, post_json("/sagas", &order_body("api-dup"))).await;

    assert_eq!(first, StatusCode::ACCEPTED);
    assert_eq!(second, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("api-dup"));
}

#[tokio::test]
async fn test_get_unknown_saga_not_found() {
    let app = setup();

    let (status, json) = send(&app, get("/sagas/does-not-exist")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_saga_status_after_execution() {
    let (app, state) = setup_with_state();
    send(&app, post_json("/sagas", &order_body("api-run-1"))).await;

    let (_, before) = send(&app, get("/sagas/api-run-1")).await;
    assert_eq!(before["order_status"], "pending");
    assert_eq!(before["total_cents"], 4500);

    let result = state
        .orchestrator
        .execute_saga(&CorrelationId::new("api-run-1"))
        .await
        .unwrap();
    assert_eq!(result.final_status.as_str(), "COMPLETED");

    let (status, after) = send(&app, get("/sagas/api-run-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(after["status"], "COMPLETED");
    assert_eq!(after["order_status"], "confirmed");
    assert_eq!(after["completed_steps"].as_array().unwrap().len(), 6);
    assert_eq!(after["reservation_ids"].as_array().unwrap().len(), 2);
    assert!(after["payment_id"].is_string());
    assert!(after["completed_at"].is_string());
}

#[tokio::test]
async fn test_rejected_payment_shows_cancelled_order() {
    let (app, state) = setup_with_state();
    state
        .services
        .payment
        .set_fault("charge", Fault::reject("fraud_detected"))
        .await;
    send(&app, post_json("/sagas", &order_body("api-fraud"))).await;

    state
        .orchestrator
        .execute_saga(&CorrelationId::new("api-fraud"))
        .await
        .unwrap();

    let (_, json) = send(&app, get("/sagas/api-fraud")).await;
    assert_eq!(json["status"], "COMPENSATED");
    assert_eq!(json["order_status"], "cancelled");
    assert_eq!(json["failure_reason"], "fraud_detected");
    assert_eq!(state.services.inventory.held_count().await, 0);
}

#[tokio::test]
async fn test_cancel_started_saga() {
    let (app, _) = setup_with_state();
    send(&app, post_json("/sagas", &order_body("api-cancel"))).await;

    let (status, json) = send(&app, post_empty("/sagas/api-cancel/cancel")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "applied");
    assert_eq!(json["status"], "COMPENSATED");

    let (_, saga) = send(&app, get("/sagas/api-cancel")).await;
    assert_eq!(saga["failure_reason"], "cancelled");
    assert_eq!(saga["order_status"], "cancelled");
}

#[tokio::test]
async fn test_cancel_finished_saga_is_noop() {
    let (app, state) = setup_with_state();
    send(&app, post_json("/sagas", &order_body("api-done"))).await;
    state
        .orchestrator
        .execute_saga(&CorrelationId::new("api-done"))
        .await
        .unwrap();

    let (status, json) = send(&app, post_empty("/sagas/api-done/cancel")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "already_finished");
    assert_eq!(json["status"], "COMPLETED");
}

#[tokio::test]
async fn test_cancel_unknown_saga_not_found() {
    let app = setup();

    let (status, _) = send(&app, post_empty("/sagas/nope/cancel")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_circuit_breakers_listed() {
    let app = setup();

    let (status, json) = send(&app, get("/circuit-breakers")).await;

    assert_eq!(status, StatusCode::OK);
    for dependency in ["inventory", "payment", "notification"] {
        assert_eq!(json[dependency]["state"], "CLOSED");
        assert_eq!(json[dependency]["failure_count"], 0);
    }
}

#[tokio::test]
async fn test_parked_outbox_rows_listed() {
    let (app, state) = setup_with_state();
    let appended = state
        .store
        .append(vec![
            NewOutboxEvent::new(
                "Payment",
                AggregateId::new(),
                "RefundRequested",
                Some(serde_json::json!({ "payment_id": "PAY-0001" })),
                IdempotencyKey::from("api-parked-1"),
            )
            .with_max_retries(1),
        ])
        .await
        .unwrap();
    state
        .store
        .record_failure(appended[0].id, "queue down", chrono::Utc::now())
        .await
        .unwrap();

    let (status, json) = send(&app, get("/outbox/parked?limit=10")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["pending_count"], 1);
    let parked = json["parked"].as_array().unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0]["event_type"], "RefundRequested");
    assert_eq!(parked[0]["last_error"], "queue down");
}

#[tokio::test]
async fn test_start_event_flows_through_relay_to_worker() {
    let (app, state) = setup_with_state();
    let dispatcher = InMemoryJobDispatcher::new();
    let jobs = dispatcher.subscribe(SAGA_QUEUE).await;
    let relay = OutboxRelay::new(
        state.store.clone(),
        Arc::new(dispatcher.clone()),
        Config::default().relay_config(),
    );
    let pool = SagaWorkerPool::new(state.orchestrator.clone(), 2);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(api::jobs::consume_saga_jobs(jobs, pool, shutdown_rx));

    send(&app, post_json("/sagas", &order_body("api-e2e"))).await;
    let report = relay.poll_once().await.unwrap();
    assert_eq!(report.dispatched, 1);

    let mut order_status = serde_json::Value::Null;
    for _ in 0..100 {
        let (_, json) = send(&app, get("/sagas/api-e2e")).await;
        order_status = json["order_status"].clone();
        if order_status == "confirmed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(order_status, "confirmed");

    shutdown_tx.send(true).unwrap();
    consumer.await.unwrap();
    assert_eq!(dispatcher.jobs_for(SAGA_QUEUE).await.len(), 1);
}
