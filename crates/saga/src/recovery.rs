//! Crash recovery sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use saga_store::SagaStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::{Result, SagaError};
use crate::orchestrator::SagaOrchestrator;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub resumed: usize,
    /// Sagas another execution currently owns.
    pub skipped_locked: usize,
    pub errors: usize,
}

/// Periodically resumes in-flight sagas whose owner went away, sagas whose
/// retry is due, and sagas past their TTL.
pub struct RecoverySweeper<S: SagaStore> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    batch_size: usize,
    concurrency: usize,
}

impl<S: SagaStore> RecoverySweeper<S> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<S>>) -> Self {
        Self {
            orchestrator,
            batch_size: 100,
            concurrency: 8,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs one sweep.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let due = self
            .orchestrator
            .store()
            .find_resumable(Utc::now(), self.batch_size)
            .await?;

        let mut report = RecoveryReport {
            scanned: due.len(),
            ..RecoveryReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let orchestrator = &self.orchestrator;
        let outcomes: Vec<_> = futures_util::stream::iter(due)
            .map(move |saga| async move {
                let correlation_id = saga.correlation_id().clone();
                let outcome = orchestrator.execute_saga(&correlation_id).await;
                (correlation_id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (correlation_id, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    report.resumed += 1;
                    tracing::debug!(
                        %correlation_id,
                        status = %result.final_status,
                        "saga resumed"
                    );
                }
                Err(SagaError::Locked(_)) => report.skipped_locked += 1,
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(%correlation_id, error = %err, "failed to resume saga");
                }
            }
        }

        metrics::counter!("saga_recovered_total").increment(report.resumed as u64);
        tracing::info!(
            scanned = report.scanned,
            resumed = report.resumed,
            skipped_locked = report.skipped_locked,
            errors = report.errors,
            "recovery sweep finished"
        );
        Ok(report)
    }

    /// Sweeps every `interval` until `shutdown` flips to true or its sender
    /// goes away.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.recover().await {
                        tracing::error!(error = %err, "recovery sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("recovery sweeper stopping");
                        break;
                    }
                }
            }
        }
    }
}
