//! Bounded pool of saga executions.

use std::sync::Arc;

use common::CorrelationId;
use saga_store::SagaStore;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::SagaError;
use crate::orchestrator::SagaOrchestrator;

/// Runs sagas concurrently, at most `concurrency` at a time.
///
/// Each saga's steps still run one after another inside its own task.
/// [`submit`](Self::submit) waits for a free slot, which pushes back on
/// whatever feeds the pool.
pub struct SagaWorkerPool<S: SagaStore + 'static> {
    orchestrator: Arc<SagaOrchestrator<S>>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    tasks: JoinSet<()>,
}

impl<S: SagaStore + 'static> SagaWorkerPool<S> {
    pub fn new(orchestrator: Arc<SagaOrchestrator<S>>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            tasks: JoinSet::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Executions currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    /// Schedules an execution of the saga once a slot is free.
    pub async fn submit(&mut self, correlation_id: CorrelationId) {
        while self.tasks.try_join_next().is_some() {}

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            tracing::warn!(%correlation_id, "worker pool closed, dropping saga");
            return;
        };

        let orchestrator = self.orchestrator.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            match orchestrator.execute_saga(&correlation_id).await {
                Ok(result) => tracing::debug!(
                    %correlation_id,
                    status = %result.final_status,
                    "saga execution finished"
                ),
                // The owner will finish it; nothing to do here.
                Err(SagaError::Locked(_)) => {
                    tracing::debug!(%correlation_id, "saga already running elsewhere")
                }
                Err(err) => {
                    tracing::error!(%correlation_id, error = %err, "saga execution failed")
                }
            }
        });
    }

    /// Waits for every submitted execution to finish.
    pub async fn shutdown(mut self) {
        self.permits.close();
        while self.tasks.join_next().await.is_some() {}
    }
}
