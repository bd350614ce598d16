use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, Version};
use domain::{NewOutboxEvent, OutboxEvent, SagaInstance, SagaStatus};
use tokio::sync::RwLock;

use crate::{
    Result, StoreError,
    store::{OutboxStore, SagaStore},
};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct OutboxRow {
    event: OutboxEvent,
    claimed_by: Option<String>,
    claimed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    sagas: HashMap<CorrelationId, SagaInstance>,
    leases: HashMap<CorrelationId, Lease>,
    outbox: Vec<OutboxRow>,
    sequences: HashMap<AggregateId, i64>,
}

impl Inner {
    /// Appends rows, skipping idempotency keys already present.
    fn append_events(&mut self, events: Vec<NewOutboxEvent>) -> Vec<OutboxEvent> {
        let mut written = Vec::with_capacity(events.len());
        for new_event in events {
            if self
                .outbox
                .iter()
                .any(|row| row.event.idempotency_key == new_event.idempotency_key)
            {
                tracing::debug!(key = %new_event.idempotency_key, "outbox key exists, skipping");
                continue;
            }
            let seq = self.sequences.entry(new_event.aggregate_id).or_insert(0);
            *seq += 1;
            let event = new_event.into_event(*seq);
            written.push(event.clone());
            self.outbox.push(OutboxRow {
                event,
                claimed_by: None,
                claimed_until: None,
            });
        }
        written
    }

    fn row_mut(&mut self, id: AggregateId) -> Result<&mut OutboxRow> {
        self.outbox
            .iter_mut()
            .find(|row| row.event.id == id)
            .ok_or(StoreError::OutboxEventNotFound(id))
    }
}

/// In-memory saga and outbox store.
///
/// Sagas, leases and outbox rows share one lock, so a saga update and its
/// outbox rows become visible together, as they would in one database
/// transaction.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.inner.read().await.sagas.len()
    }

    /// Returns every outbox row, in insertion order.
    pub async fn all_events(&self) -> Vec<OutboxEvent> {
        self.inner
            .read()
            .await
            .outbox
            .iter()
            .map(|row| row.event.clone())
            .collect()
    }

    /// Writes a saga row as-is, bypassing version checks.
    ///
    /// Lets tests stage a saga as a crashed process would have left it.
    pub async fn put_raw(&self, saga: SagaInstance) {
        self.inner
            .write()
            .await
            .sagas
            .insert(saga.correlation_id().clone(), saga);
    }

    /// Writes an outbox row as-is, e.g. one with a null payload or a foreign
    /// aggregate type.
    pub async fn put_raw_event(&self, event: OutboxEvent) {
        self.inner.write().await.outbox.push(OutboxRow {
            event,
            claimed_by: None,
            claimed_until: None,
        });
    }

    /// Clears all state.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
    }
}

fn oldest_first(sagas: &mut [SagaInstance]) {
    sagas.sort_by_key(|s| s.updated_at());
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, saga: &SagaInstance, events: Vec<NewOutboxEvent>) -> Result<Version> {
        let mut inner = self.inner.write().await;
        let correlation_id = saga.correlation_id().clone();
        if inner.sagas.contains_key(&correlation_id) {
            return Err(StoreError::DuplicateCorrelationId(correlation_id));
        }

        let version = Version::initial().next();
        let mut stored = saga.clone();
        stored.set_version(version);
        inner.sagas.insert(correlation_id, stored);
        inner.append_events(events);

        Ok(version)
    }

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>> {
        Ok(self.inner.read().await.sagas.get(correlation_id).cloned())
    }

    async fn update(&self, saga: &SagaInstance, events: Vec<NewOutboxEvent>) -> Result<Version> {
        let mut inner = self.inner.write().await;
        let correlation_id = saga.correlation_id().clone();

        let current = inner
            .sagas
            .get(&correlation_id)
            .map(SagaInstance::version)
            .ok_or_else(|| StoreError::SagaNotFound(correlation_id.clone()))?;

        if current != saga.version() {
            return Err(StoreError::ConcurrencyConflict {
                correlation_id,
                expected: saga.version(),
                actual: current,
            });
        }

        let version = current.next();
        let mut stored = saga.clone();
        stored.set_version(version);
        inner.sagas.insert(correlation_id, stored);
        inner.append_events(events);

        Ok(version)
    }

    async fn find_resumable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>> {
        let inner = self.inner.read().await;
        let mut sagas: Vec<_> = inner
            .sagas
            .values()
            .filter(|s| {
                let due = s.status().is_resumable() && s.next_step_at().is_none_or(|at| at <= now);
                due || s.is_expired(now)
            })
            .cloned()
            .collect();
        oldest_first(&mut sagas);
        sagas.truncate(limit);
        Ok(sagas)
    }

    async fn find_by_status(&self, status: SagaStatus, limit: usize) -> Result<Vec<SagaInstance>> {
        let inner = self.inner.read().await;
        let mut sagas: Vec<_> = inner
            .sagas
            .values()
            .filter(|s| s.status() == status)
            .cloned()
            .collect();
        oldest_first(&mut sagas);
        sagas.truncate(limit);
        Ok(sagas)
    }

    async fn try_acquire_lease(
        &self,
        correlation_id: &CorrelationId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if let Some(lease) = inner.leases.get(correlation_id)
            && lease.owner != owner
            && lease.until > now
        {
            return Ok(false);
        }
        inner.leases.insert(
            correlation_id.clone(),
            Lease {
                owner: owner.to_string(),
                until,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, correlation_id: &CorrelationId, owner: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner
            .leases
            .get(correlation_id)
            .is_some_and(|lease| lease.owner == owner)
        {
            inner.leases.remove(correlation_id);
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemorySagaStore {
    async fn append(&self, events: Vec<NewOutboxEvent>) -> Result<Vec<OutboxEvent>> {
        Ok(self.inner.write().await.append_events(events))
    }

    async fn claim_batch(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>> {
        let mut inner = self.inner.write().await;
        let mut claimed = Vec::new();
        for row in inner.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let free = row.claimed_until.is_none_or(|until| until < now);
            if row.event.is_due(now) && free {
                row.claimed_by = Some(owner.to_string());
                row.claimed_until = Some(lease_until);
                claimed.push(row.event.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: AggregateId, note: Option<&str>) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let row = inner.row_mut(id)?;
        if row.event.processed {
            return Ok(false);
        }
        row.event.processed = true;
        row.event.processed_at = Some(Utc::now());
        if let Some(note) = note {
            row.event.last_error = Some(note.to_string());
        }
        row.claimed_by = None;
        row.claimed_until = None;
        Ok(true)
    }

    async fn record_failure(
        &self,
        id: AggregateId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<OutboxEvent> {
        let mut inner = self.inner.write().await;
        let row = inner.row_mut(id)?;
        row.event.retry_count += 1;
        row.event.last_error = Some(error.to_string());
        row.event.next_retry_at = Some(next_retry_at);
        row.claimed_by = None;
        row.claimed_until = None;
        Ok(row.event.clone())
    }

    async fn get_event(&self, id: AggregateId) -> Result<Option<OutboxEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .find(|row| row.event.id == id)
            .map(|row| row.event.clone()))
    }

    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<_> = inner
            .outbox
            .iter()
            .filter(|row| row.event.aggregate_id == aggregate_id)
            .map(|row| row.event.clone())
            .collect();
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    async fn parked(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|row| row.event.is_parked())
            .take(limit)
            .map(|row| row.event.clone())
            .collect())
    }

    async fn pending_count(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.outbox.iter().filter(|row| !row.event.processed).count() as u64)
    }
}
