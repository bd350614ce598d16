//! Saga queue consumer.

use common::CorrelationId;
use outbox::Job;
use saga::SagaWorkerPool;
use saga_store::SagaStore;
use tokio::sync::{mpsc, watch};

/// Correlation ID a saga job refers to.
///
/// Taken from the job envelope, or from the event data for jobs that were
/// written without one.
pub fn correlation_id_of(job: &Job) -> Option<CorrelationId> {
    job.payload.correlation_id.clone().or_else(|| {
        job.payload
            .data
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .map(CorrelationId::new)
    })
}

/// Feeds saga jobs into the worker pool until `shutdown` flips to true,
/// then waits for running sagas to finish.
pub async fn consume_saga_jobs<S: SagaStore + 'static>(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    mut pool: SagaWorkerPool<S>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(concurrency = pool.concurrency(), "saga job consumer started");

    loop {
        tokio::select! {
            job = jobs.recv() => {
                let Some(job) = job else {
                    tracing::info!("saga job queue closed");
                    break;
                };
                match correlation_id_of(&job) {
                    Some(correlation_id) => {
                        tracing::debug!(job_id = %job.id, %correlation_id, "saga job received");
                        pool.submit(correlation_id).await;
                    }
                    None => tracing::warn!(
                        job_id = %job.id,
                        event_type = %job.payload.event_type,
                        "saga job without correlation id dropped"
                    ),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("saga job consumer stopping");
                    break;
                }
            }
        }
    }

    pool.shutdown().await;
}
