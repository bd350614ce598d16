//! Outbox relay: moves committed outbox rows onto job queues.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use domain::{AggregateKind, OutboxEvent};
use saga_store::OutboxStore;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::{JobDispatcher, JobOptions, JobPayload, SAGA_QUEUE};
use crate::error::Result;
use crate::payload::CapabilityJob;

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// How long a claimed row stays reserved for this relay.
    pub claim_lease: Duration,
    /// Wait before the first redelivery; doubles per failure.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            claim_lease: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
        }
    }
}

impl RelayConfig {
    /// Delay before the next attempt once `failures` deliveries failed.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.retry_max_delay)
    }
}

/// Counts from one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub claimed: usize,
    pub dispatched: usize,
    /// Rows nobody can act on, closed without dispatch.
    pub not_actionable: usize,
    pub failed: usize,
    /// Failed rows that used up their last attempt in this poll.
    pub parked: usize,
}

/// Queue that receives events of an aggregate kind.
pub fn queue_for(kind: AggregateKind) -> &'static str {
    match kind {
        AggregateKind::Saga => SAGA_QUEUE,
        AggregateKind::Order => "order-events",
        AggregateKind::Inventory => "inventory-jobs",
        AggregateKind::Payment => "payment-jobs",
        AggregateKind::Notification => "notification-jobs",
    }
}

fn priority_for(kind: AggregateKind) -> i32 {
    match kind {
        AggregateKind::Saga => 10,
        _ => 0,
    }
}

enum Delivery {
    Dispatched,
    NotActionable,
    Failed { parked: bool },
}

/// Polls the outbox and dispatches due rows.
///
/// Rows are claimed atomically, so several relays can poll the same store
/// without dispatching a row twice while its claim is live. One row failing
/// never holds back the others.
pub struct OutboxRelay<S: OutboxStore> {
    store: S,
    dispatcher: Arc<dyn JobDispatcher>,
    config: RelayConfig,
    owner_id: String,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(store: S, dispatcher: Arc<dyn JobDispatcher>, config: RelayConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
            owner_id: format!("relay-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Claims one batch and delivers it.
    #[tracing::instrument(skip(self), fields(owner = %self.owner_id))]
    pub async fn poll_once(&self) -> Result<RelayReport> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(self.config.claim_lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let claimed = self
            .store
            .claim_batch(&self.owner_id, self.config.batch_size, now, lease_until)
            .await?;

        let mut report = RelayReport {
            claimed: claimed.len(),
            ..RelayReport::default()
        };

        for event in &claimed {
            match self.deliver(event).await {
                Ok(Delivery::Dispatched) => report.dispatched += 1,
                Ok(Delivery::NotActionable) => report.not_actionable += 1,
                Ok(Delivery::Failed { parked }) => {
                    report.failed += 1;
                    if parked {
                        report.parked += 1;
                    }
                }
                Err(err) => {
                    // The claim runs out and the row is picked up again.
                    report.failed += 1;
                    tracing::error!(event_id = %event.id, error = %err, "outbox bookkeeping failed");
                }
            }
        }

        if report.claimed > 0 {
            tracing::debug!(
                claimed = report.claimed,
                dispatched = report.dispatched,
                failed = report.failed,
                "outbox poll finished"
            );
        }
        Ok(report)
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<Delivery> {
        let kind = match event.aggregate_type.parse::<AggregateKind>() {
            Ok(kind) => kind,
            Err(_) => {
                return self
                    .close_not_actionable(event, "unknown aggregate type")
                    .await;
            }
        };
        let job = match CapabilityJob::decode(kind, event) {
            Ok(job) => job,
            Err(err) => return self.close_not_actionable(event, &err.to_string()).await,
        };
        let mut payload = JobPayload::from_event(event, Value::Null);
        if let Some(correlation_id) = job.correlation_id() {
            payload.correlation_id = Some(correlation_id.clone());
        }
        payload.data = match job.into_value() {
            Ok(data) => data,
            Err(err) => return self.close_not_actionable(event, &err.to_string()).await,
        };

        let queue = queue_for(kind);
        let options = JobOptions {
            idempotency_key: Some(event.idempotency_key.clone()),
            priority: priority_for(kind),
        };

        match self
            .dispatcher
            .enqueue(queue, payload, options)
            .await
        {
            Ok(job_id) => {
                self.store.mark_processed(event.id, None).await?;
                metrics::counter!("outbox_events_dispatched_total", "queue" => queue)
                    .increment(1);
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    queue,
                    %job_id,
                    "outbox event dispatched"
                );
                Ok(Delivery::Dispatched)
            }
            Err(err) => {
                let delay = self.config.retry_delay(event.retry_count + 1);
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                let updated = self
                    .store
                    .record_failure(event.id, &err.to_string(), next_retry_at)
                    .await?;
                metrics::counter!("outbox_events_failed_total", "queue" => queue).increment(1);

                let parked = updated.is_parked();
                if parked {
                    metrics::counter!("outbox_events_parked_total").increment(1);
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count = updated.retry_count,
                        error = %err,
                        "outbox event parked after final attempt"
                    );
                } else {
                    tracing::warn!(
                        event_id = %event.id,
                        retry_count = updated.retry_count,
                        %next_retry_at,
                        error = %err,
                        "outbox dispatch failed"
                    );
                }
                Ok(Delivery::Failed { parked })
            }
        }
    }

    async fn close_not_actionable(&self, event: &OutboxEvent, why: &str) -> Result<Delivery> {
        let note = format!("not actionable: {why}");
        self.store.mark_processed(event.id, Some(&note)).await?;
        metrics::counter!("outbox_events_not_actionable_total").increment(1);
        tracing::warn!(
            event_id = %event.id,
            aggregate_type = %event.aggregate_type,
            event_type = %event.event_type,
            reason = why,
            "outbox event not actionable"
        );
        Ok(Delivery::NotActionable)
    }

    /// Polls every `poll_interval` until `shutdown` flips to true or its
    /// sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        tracing::error!(error = %err, "outbox poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("outbox relay stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_queue() {
        let queues: Vec<_> = AggregateKind::ALL.into_iter().map(queue_for).collect();
        assert_eq!(
            queues,
            vec![
                "saga",
                "order-events",
                "inventory-jobs",
                "payment-jobs",
                "notification-jobs"
            ]
        );
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = RelayConfig {
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(5),
            ..RelayConfig::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_secs(1));
        assert_eq!(config.retry_delay(2), Duration::from_secs(2));
        assert_eq!(config.retry_delay(3), Duration::from_secs(4));
        assert_eq!(config.retry_delay(4), Duration::from_secs(5));
        assert_eq!(config.retry_delay(64), Duration::from_secs(5));
    }
}
