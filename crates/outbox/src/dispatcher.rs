//! Job queue interface and an in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, IdempotencyKey};
use domain::OutboxEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};

use crate::error::DispatchError;

/// Queue whose jobs start or resume a saga.
pub const SAGA_QUEUE: &str = "saga";

/// Delivery options for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Jobs with a key already seen on the same queue are dropped.
    pub idempotency_key: Option<IdempotencyKey>,
    /// Higher runs first, where the backend supports it.
    pub priority: i32,
}

/// What the relay hands to a worker for one outbox event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub event_id: AggregateId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub sequence_number: i64,
    pub correlation_id: Option<CorrelationId>,
    pub data: serde_json::Value,
}

impl JobPayload {
    pub fn from_event(event: &OutboxEvent, data: serde_json::Value) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id,
            sequence_number: event.sequence_number,
            correlation_id: event.correlation_id.clone(),
            data,
        }
    }
}

/// An accepted job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub enqueued_at: DateTime<Utc>,
}

/// Hands work to background workers with at-least-once delivery.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Enqueues a job and returns its ID.
    ///
    /// Enqueuing again with the same idempotency key on the same queue
    /// returns the ID of the original job.
    async fn enqueue(
        &self,
        queue: &str,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<String, DispatchError>;
}

#[derive(Debug, Default)]
struct InMemoryDispatcherState {
    jobs: Vec<Job>,
    by_key: HashMap<(String, IdempotencyKey), String>,
    subscribers: HashMap<String, mpsc::UnboundedSender<Job>>,
    failures_left: u32,
    unavailable: bool,
    next_id: u64,
}

/// In-memory dispatcher.
///
/// Keeps every accepted job for inspection and forwards jobs to a
/// subscriber of their queue, if there is one.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobDispatcher {
    state: Arc<RwLock<InMemoryDispatcherState>>,
}

impl InMemoryJobDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers every job accepted from now on for `queue` to the returned
    /// receiver. A second subscription replaces the first.
    pub async fn subscribe(&self, queue: &str) -> mpsc::UnboundedReceiver<Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .write()
            .await
            .subscribers
            .insert(queue.to_string(), tx);
        rx
    }

    /// Makes the next `n` enqueues fail as unavailable.
    pub async fn fail_next(&self, n: u32) {
        self.state.write().await.failures_left = n;
    }

    /// Makes every enqueue fail until turned off again.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.state.read().await.jobs.clone()
    }

    pub async fn jobs_for(&self, queue: &str) -> Vec<Job> {
        self.state
            .read()
            .await
            .jobs
            .iter()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect()
    }

    pub async fn job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }
}

#[async_trait]
impl JobDispatcher for InMemoryJobDispatcher {
    async fn enqueue(
        &self,
        queue: &str,
        payload: JobPayload,
        options: JobOptions,
    ) -> Result<String, DispatchError> {
        let mut state = self.state.write().await;

        if state.unavailable {
            return Err(DispatchError::Unavailable("queue backend is down".into()));
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(DispatchError::Unavailable("connection refused".into()));
        }

        if let Some(key) = &options.idempotency_key
            && let Some(existing) = state.by_key.get(&(queue.to_string(), key.clone()))
        {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let job = Job {
            id: format!("JOB-{:06}", state.next_id),
            queue: queue.to_string(),
            payload,
            options,
            enqueued_at: Utc::now(),
        };
        if let Some(key) = &job.options.idempotency_key {
            state
                .by_key
                .insert((queue.to_string(), key.clone()), job.id.clone());
        }
        if let Some(subscriber) = state.subscribers.get(queue)
            && subscriber.send(job.clone()).is_err()
        {
            tracing::debug!(queue, "job subscriber went away");
        }

        let id = job.id.clone();
        state.jobs.push(job);
        Ok(id)
    }
}
