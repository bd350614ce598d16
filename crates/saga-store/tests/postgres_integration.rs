//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and need a Docker daemon.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{AggregateId, CorrelationId, IdempotencyKey};
use domain::{
    Money, NewOutboxEvent, OrderItem, SagaData, SagaInstance, SagaStatus, SagaStep, StepMetric,
    UserId,
};
use saga_store::{OutboxStore, PostgresSagaStore, SagaStore, StoreError, Version};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_saga_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_instances, saga_leases, outbox_events")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn new_saga(correlation: &str) -> SagaInstance {
    let data = SagaData::new(
        AggregateId::new(),
        UserId::new(),
        vec![
            OrderItem::new("P1", 2, Money::from_cents(1000)),
            OrderItem::new("P2", 1, Money::from_cents(2500)),
        ],
    )
    .unwrap();
    SagaInstance::new(CorrelationId::new(correlation), data, 3, Duration::hours(24))
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for the PostgreSQL container"]
async fn create_and_load_round_trips_every_field() {
    let store = get_test_store().await;
    let mut saga = new_saga("pg-1");
    saga.begin_step(SagaStep::StockVerified).unwrap();
    saga.complete_step(StepMetric::new(SagaStep::StockVerified, 12, true, 2))
        .unwrap();

    let version = store
        .create(&saga, vec![NewOutboxEvent::saga_start_requested(&saga)])
        .await
        .unwrap();
    assert_eq!(version, Version::new(1));

    let loaded = store.get(saga.correlation_id()).await.unwrap().unwrap();
    assert_eq!(loaded.id(), saga.id());
    assert_eq!(loaded.status(), SagaStatus::Running);
    assert_eq!(loaded.completed_steps(), &[SagaStep::StockVerified]);
    assert_eq!(loaded.saga_data(), saga.saga_data());
    assert_eq!(loaded.version(), Version::new(1));

    let events = store.events_for_aggregate(saga.id()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "SagaStartRequested");
    assert_eq!(events[0].sequence_number, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for the PostgreSQL container"]
async fn duplicate_correlation_id_is_rejected() {
    let store = get_test_store().await;
    store.create(&new_saga("pg-dup"), vec![]).await.unwrap();

    let result = store.create(&new_saga("pg-dup"), vec![]).await;
    assert!(matches!(result, Err(StoreError::DuplicateCorrelationId(_))));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for the PostgreSQL container"]
async fn stale_update_conflicts() {
    let store = get_test_store().await;
    let saga = new_saga("pg-conflict");
    store.create(&saga, vec![]).await.unwrap();

    let mut current = store.get(saga.correlation_id()).await.unwrap().unwrap();
    let stale = current.clone();

    current.begin_step(SagaStep::StockVerified).unwrap();
    let v2 = store.update(&current, vec![]).await.unwrap();
    assert_eq!(v2, Version::new(2));

    let result = store.update(&stale, vec![]).await;
    assert!(matches!(
        result,
        Err(StoreError::ConcurrencyConflict { expected, actual, .. })
            if expected == Version::new(1) && actual == Version::new(2)
    ));

    let missing = store.update(&new_saga("pg-missing"), vec![]).await;
    assert!(matches!(missing, Err(StoreError::SagaNotFound(_))));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for the PostgreSQL container"]
async fn outbox_claim_ack_and_park() {
    let store = get_test_store().await;
    let aggregate = AggregateId::new();
    let event = |key: &str| {
        NewOutboxEvent::new(
            "Order",
            aggregate,
            "OrderConfirmed",
            Some(serde_json::json!({"n": key})),
            IdempotencyKey::from(key),
        )
        .with_max_retries(1)
    };

    let written = store
        .append(vec![event("k-1"), event("k-2"), event("k-1")])
        .await
        .unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(written[1].sequence_number, 2);

    let now = Utc::now();
    let lease = now + Duration::seconds(30);
    let claimed = store.claim_batch("relay-a", 10, now, lease).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert!(store.claim_batch("relay-b", 10, now, lease).await.unwrap().is_empty());

    assert!(store.mark_processed(claimed[0].id, None).await.unwrap());
    assert!(!store.mark_processed(claimed[0].id, None).await.unwrap());

    let failed = store
        .record_failure(claimed[1].id, "queue down", now)
        .await
        .unwrap();
    assert!(failed.is_parked());
    assert_eq!(store.parked(10).await.unwrap().len(), 1);
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for the PostgreSQL container"]
async fn lease_is_single_owner() {
    let store = get_test_store().await;
    let id = CorrelationId::new("pg-lease");
    let now = Utc::now();
    let until = now + Duration::minutes(5);

    assert!(store.try_acquire_lease(&id, "w-1", now, until).await.unwrap());
    assert!(!store.try_acquire_lease(&id, "w-2", now, until).await.unwrap());

    store.release_lease(&id, "w-1").await.unwrap();
    assert!(store.try_acquire_lease(&id, "w-2", now, until).await.unwrap());
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for the PostgreSQL container"]
async fn find_resumable_skips_waiting_and_terminal() {
    let store = get_test_store().await;
    let now = Utc::now();

    let mut running = new_saga("pg-running");
    running.begin_step(SagaStep::StockVerified).unwrap();
    store.create(&running, vec![]).await.unwrap();

    let mut waiting = new_saga("pg-waiting");
    waiting.begin_step(SagaStep::StockVerified).unwrap();
    waiting.schedule_retry(now + Duration::minutes(5)).unwrap();
    store.create(&waiting, vec![]).await.unwrap();

    let mut done = new_saga("pg-done");
    done.begin_step(SagaStep::StockVerified).unwrap();
    done.complete().unwrap();
    store.create(&done, vec![]).await.unwrap();

    let found = store.find_resumable(now, 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].correlation_id().as_str(), "pg-running");

    let completed = store.find_by_status(SagaStatus::Completed, 10).await.unwrap();
    assert_eq!(completed.len(), 1);
}
