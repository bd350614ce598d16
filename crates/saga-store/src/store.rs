use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, Version};
use domain::{NewOutboxEvent, OutboxEvent, SagaInstance, SagaStatus};

use crate::Result;

/// Persistence for saga instances.
///
/// Every write is conditional on the version the caller last read, and any
/// outbox rows passed alongside are written atomically with the saga row.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts a new saga at version 1 together with `events`.
    ///
    /// Fails with `DuplicateCorrelationId` if the correlation ID is taken.
    async fn create(&self, saga: &SagaInstance, events: Vec<NewOutboxEvent>) -> Result<Version>;

    /// Loads a saga by correlation ID.
    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>>;

    /// Replaces the stored saga if its version still equals `saga.version()`,
    /// appending `events` in the same transaction.
    ///
    /// Returns the new version. Fails with `ConcurrencyConflict` otherwise.
    async fn update(&self, saga: &SagaInstance, events: Vec<NewOutboxEvent>) -> Result<Version>;

    /// Sagas a recovery sweep should pick up at `now`: in-flight sagas whose
    /// `next_step_at` is unset or elapsed, plus non-terminal sagas past
    /// `expires_at`. Oldest update first.
    async fn find_resumable(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<SagaInstance>>;

    /// Sagas currently in `status`, oldest update first.
    async fn find_by_status(&self, status: SagaStatus, limit: usize) -> Result<Vec<SagaInstance>>;

    /// Takes the single-owner lease on a saga until `until`.
    ///
    /// Succeeds if nobody holds the lease, the previous lease expired, or
    /// `owner` already holds it. Returns false when another owner holds it.
    async fn try_acquire_lease(
        &self,
        correlation_id: &CorrelationId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drops the lease if `owner` holds it.
    async fn release_lease(&self, correlation_id: &CorrelationId, owner: &str) -> Result<()>;
}

/// Persistence for the transactional outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Appends rows outside any saga transition.
    ///
    /// Rows whose idempotency key already exists are skipped; only the rows
    /// actually written are returned.
    async fn append(&self, events: Vec<NewOutboxEvent>) -> Result<Vec<OutboxEvent>>;

    /// Atomically claims up to `limit` due rows for `owner` until `lease_until`.
    ///
    /// A row is due when it is unprocessed, not parked, its `next_retry_at`
    /// has elapsed and no other relay holds an unexpired claim on it.
    async fn claim_batch(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>>;

    /// Flips `processed` to true. Returns false if it already was.
    async fn mark_processed(&self, id: AggregateId, note: Option<&str>) -> Result<bool>;

    /// Counts a failed delivery and schedules the next attempt.
    async fn record_failure(
        &self,
        id: AggregateId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<OutboxEvent>;

    async fn get_event(&self, id: AggregateId) -> Result<Option<OutboxEvent>>;

    /// Rows for an aggregate in sequence order.
    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEvent>>;

    /// Rows that used up their delivery attempts.
    async fn parked(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Number of unprocessed rows, parked included.
    async fn pending_count(&self) -> Result<u64>;
}
