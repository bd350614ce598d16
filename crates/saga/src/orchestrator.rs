//! Saga orchestrator driving the order fulfillment state machine.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use common::{AggregateId, CorrelationId};
use domain::{
    CompensationRecord, NewOutboxEvent, OrderItem, SagaData, SagaInstance, SagaStatus, SagaStep,
    StepErrorRecord, StepMetric, UserId,
};
use saga_store::SagaStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cancellation::CancellationRegistry;
use crate::compensation::{self, CompensationAction};
use crate::config::{OrchestratorConfig, to_chrono};
use crate::error::{CapabilityError, Result, SagaError};
use crate::resilience::{CircuitBreakerRegistry, CircuitBreakerStats, RetryExecutor};
use crate::steps::{Capabilities, StepEffects};

/// Reason recorded when an operator called the saga off.
pub const REASON_CANCELLED: &str = "cancelled";
/// Reason recorded when a saga outlived its TTL.
pub const REASON_EXPIRED: &str = "saga_expired";

/// Input of [`SagaOrchestrator::start_saga`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSagaRequest {
    pub correlation_id: CorrelationId,
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
}

/// What one call to [`SagaOrchestrator::execute_saga`] achieved.
#[derive(Debug, Clone)]
pub struct SagaExecutionResult {
    pub correlation_id: CorrelationId,
    pub final_status: SagaStatus,
    pub total_duration: Duration,
    pub compensation_executed: bool,
    pub step_metrics: Vec<StepMetric>,
}

/// Result of [`SagaOrchestrator::request_cancellation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationOutcome {
    /// The saga was already terminal; nothing to cancel.
    AlreadyFinished(SagaStatus),
    /// The cancellation ran to this status.
    Applied(SagaStatus),
    /// Another execution holds the saga; it will observe the request
    /// before its next step.
    Pending,
}

/// How a forward step ended, from the loop's point of view.
enum StepFlow {
    Advance,
    /// The saga left the forward path (parked, failed or compensated).
    Stop,
}

/// Drives sagas through the fixed step topology.
///
/// Every transition is persisted before the next one starts. Step failures
/// never escape as errors: they end up as saga transitions. Only store,
/// domain and lease problems surface as [`SagaError`].
pub struct SagaOrchestrator<S: SagaStore> {
    store: S,
    capabilities: Capabilities,
    breakers: CircuitBreakerRegistry,
    cancellations: CancellationRegistry,
    config: OrchestratorConfig,
    owner_id: String,
}

impl<S: SagaStore> SagaOrchestrator<S> {
    /// Creates a new orchestrator with its own breakers and cancellation registry.
    pub fn new(store: S, capabilities: Capabilities, config: OrchestratorConfig) -> Self {
        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        Self {
            store,
            capabilities,
            breakers,
            cancellations: CancellationRegistry::new(),
            config,
            owner_id: format!("orchestrator-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Shares breakers with other orchestrators in the same process.
    pub fn with_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_cancellations(mut self, cancellations: CancellationRegistry) -> Self {
        self.cancellations = cancellations;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Creates a saga in `STARTED` and asks a worker to run it.
    ///
    /// The `SagaStartRequested` outbox row is written in the same
    /// transaction as the saga row.
    #[tracing::instrument(skip(self, request), fields(correlation_id = %request.correlation_id))]
    pub async fn start_saga(&self, request: StartSagaRequest) -> Result<SagaInstance> {
        let data = SagaData::new(request.order_id, request.user_id, request.items)?;
        let mut saga = SagaInstance::new(
            request.correlation_id,
            data,
            self.config.saga_max_retries,
            to_chrono(self.config.saga_ttl),
        );

        let event = NewOutboxEvent::saga_start_requested(&saga);
        let version = self.store.create(&saga, vec![event]).await?;
        saga.set_version(version);

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(saga_id = %saga.id(), "saga started");
        Ok(saga)
    }

    pub async fn get_saga(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>> {
        Ok(self.store.get(correlation_id).await?)
    }

    /// Runs a saga as far as it can go right now.
    ///
    /// Terminal sagas and sagas waiting for a scheduled retry are returned
    /// as they are. Fails with [`SagaError::Locked`] if another execution
    /// owns the saga.
    #[tracing::instrument(skip(self, correlation_id), fields(correlation_id = %correlation_id))]
    pub async fn execute_saga(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<SagaExecutionResult> {
        metrics::counter!("saga_executions_total").increment(1);
        let started = Instant::now();

        let saga = self.load(correlation_id).await?;
        if saga.status().is_terminal() {
            self.cancellations.take(correlation_id).await;
            return Ok(execution_result(&saga, started));
        }

        let owner = format!("{}:{}", self.owner_id, uuid::Uuid::new_v4());
        if !self.renew_lease(correlation_id, &owner).await? {
            tracing::debug!(%owner, "saga is owned by another execution");
            return Err(SagaError::Locked(correlation_id.clone()));
        }

        let result = self.drive(correlation_id, &owner, started).await;

        if let Err(err) = self.store.release_lease(correlation_id, &owner).await {
            tracing::warn!(error = %err, "failed to release saga lease");
        }
        result
    }

    /// Asks a saga to stop and undo what it did.
    ///
    /// The request is observed between steps. If no other execution holds
    /// the saga it is applied right away.
    #[tracing::instrument(skip(self, correlation_id), fields(correlation_id = %correlation_id))]
    pub async fn request_cancellation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<CancellationOutcome> {
        let saga = self.load(correlation_id).await?;
        if saga.status().is_terminal() {
            return Ok(CancellationOutcome::AlreadyFinished(saga.status()));
        }

        self.cancellations.request(correlation_id.clone()).await;
        tracing::info!("cancellation requested");

        match self.execute_saga(correlation_id).await {
            Ok(result) => Ok(CancellationOutcome::Applied(result.final_status)),
            Err(SagaError::Locked(_)) => Ok(CancellationOutcome::Pending),
            Err(err) => Err(err),
        }
    }

    /// Breaker counters for every dependency.
    pub async fn circuit_breaker_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.breakers.stats().await
    }

    async fn load(&self, correlation_id: &CorrelationId) -> Result<SagaInstance> {
        self.store
            .get(correlation_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(correlation_id.clone()))
    }

    async fn renew_lease(&self, correlation_id: &CorrelationId, owner: &str) -> Result<bool> {
        let now = Utc::now();
        let until = now + to_chrono(self.config.lease_duration);
        Ok(self
            .store
            .try_acquire_lease(correlation_id, owner, now, until)
            .await?)
    }

    async fn persist(&self, saga: &mut SagaInstance, events: Vec<NewOutboxEvent>) -> Result<()> {
        let version = self.store.update(saga, events).await?;
        saga.set_version(version);
        Ok(())
    }

    /// The body of an execution, run while holding the lease.
    async fn drive(
        &self,
        correlation_id: &CorrelationId,
        owner: &str,
        started: Instant,
    ) -> Result<SagaExecutionResult> {
        // Re-read under the lease; the previous owner may have moved it on.
        let mut saga = self.load(correlation_id).await?;
        let now = Utc::now();

        if saga.status().is_terminal() {
            self.cancellations.take(correlation_id).await;
            return Ok(execution_result(&saga, started));
        }

        if saga.status() == SagaStatus::Compensating {
            self.cancellations.take(correlation_id).await;
            self.compensate(&mut saga).await?;
            return Ok(execution_result(&saga, started));
        }

        if saga.is_expired(now) {
            tracing::warn!(expires_at = %saga.expires_at(), "saga expired");
            metrics::counter!("saga_expired_total").increment(1);
            self.abort(&mut saga, REASON_EXPIRED, None).await?;
            return Ok(execution_result(&saga, started));
        }

        if saga.is_waiting(now) && !self.cancellations.is_requested(correlation_id).await {
            tracing::debug!(next_step_at = ?saga.next_step_at(), "saga is waiting for its retry");
            return Ok(execution_result(&saga, started));
        }

        loop {
            if self.cancellations.take(correlation_id).await {
                tracing::info!(step = ?saga.current_step(), "cancelling saga");
                self.abort(&mut saga, REASON_CANCELLED, None).await?;
                break;
            }

            let Some(step) = saga.next_step() else {
                self.finish(&mut saga).await?;
                break;
            };

            if !self.renew_lease(correlation_id, owner).await? {
                tracing::warn!("lost saga lease");
                return Err(SagaError::Locked(correlation_id.clone()));
            }

            saga.begin_step(step)?;
            self.persist(&mut saga, Vec::new()).await?;

            match self.run_step(&mut saga, step).await? {
                StepFlow::Advance => continue,
                StepFlow::Stop => break,
            }
        }

        Ok(execution_result(&saga, started))
    }

    /// Runs one step through the breaker, the retry executor and the step
    /// timeout, then records the outcome.
    async fn run_step(&self, saga: &mut SagaInstance, step: SagaStep) -> Result<StepFlow> {
        tracing::info!(step = step.as_str(), sequence = saga.step_sequence(), "saga step started");

        let breaker = self.breakers.get(step.capability());
        let executor = RetryExecutor::new(self.config.policy_for(step).clone());
        let timeout = self.config.step_timeout;
        let saga_id = saga.id();
        let data = saga.saga_data().clone();
        let effects = Mutex::new(StepEffects::default());

        let capabilities = &self.capabilities;
        let breaker = &breaker;
        let data = &data;
        let effects_ref = &effects;

        let outcome = executor
            .execute(move || async move {
                breaker
                    .call(|| async move {
                        tokio::time::timeout(
                            timeout,
                            capabilities.perform(step, saga_id, data, effects_ref),
                        )
                        .await
                        .unwrap_or(Err(CapabilityError::Timeout(timeout)))
                    })
                    .await
            })
            .await;

        metrics::histogram!("saga_step_duration_seconds", "step" => step.as_str())
            .record(outcome.duration.as_secs_f64());

        // Keep whatever the step allocated, even on failure, so compensation sees it.
        effects.into_inner().apply_to(saga.saga_data_mut()?);

        let metric = StepMetric::new(
            step,
            u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            outcome.is_success(),
            outcome.attempts,
        );

        let err = match outcome.result {
            Ok(()) => {
                saga.complete_step(metric)?;
                self.persist(saga, Vec::new()).await?;
                tracing::info!(
                    step = step.as_str(),
                    attempts = outcome.attempts,
                    "saga step completed"
                );
                return Ok(StepFlow::Advance);
            }
            Err(err) => err,
        };

        tracing::warn!(
            step = step.as_str(),
            attempts = outcome.attempts,
            error = %err,
            "saga step failed"
        );
        let record = StepErrorRecord {
            step,
            kind: err.kind().to_string(),
            message: err.to_string(),
            occurred_at: Utc::now(),
        };

        if err.allows_saga_retry() && saga.has_retry_budget() {
            saga.record_step_error(record)?;
            let next_step_at = Utc::now() + to_chrono(self.config.saga_retry_delay);
            saga.schedule_retry(next_step_at)?;
            self.persist(saga, Vec::new()).await?;
            metrics::counter!("saga_retries_scheduled_total").increment(1);
            tracing::info!(
                step = step.as_str(),
                retry_count = saga.retry_count(),
                %next_step_at,
                "saga parked for retry"
            );
            return Ok(StepFlow::Stop);
        }

        saga.record_step_failure(metric, record)?;
        let reason = err
            .rejection_code()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_failed", step.as_str().to_lowercase()));
        self.abort(saga, &reason, Some(step)).await?;
        Ok(StepFlow::Stop)
    }

    /// `RUNNING` -> `COMPLETED` with the confirmation event.
    async fn finish(&self, saga: &mut SagaInstance) -> Result<()> {
        saga.complete()?;
        let event = NewOutboxEvent::order_confirmed(saga);
        self.persist(saga, vec![event]).await?;

        let elapsed = (Utc::now() - saga.started_at())
            .to_std()
            .unwrap_or_default();
        metrics::counter!("saga_completed_total").increment(1);
        metrics::histogram!("saga_duration_seconds").record(elapsed.as_secs_f64());
        tracing::info!(duration_ms = elapsed.as_millis() as u64, "saga completed");
        Ok(())
    }

    /// Leaves the forward path.
    ///
    /// A running saga with nothing to undo goes straight to `FAILED`;
    /// everything else is compensated.
    async fn abort(
        &self,
        saga: &mut SagaInstance,
        reason: &str,
        failed_step: Option<SagaStep>,
    ) -> Result<()> {
        if saga.status() == SagaStatus::Running && compensation::plan(saga).is_empty() {
            saga.fail(reason)?;
            let event = NewOutboxEvent::order_cancelled(saga, reason);
            self.persist(saga, vec![event]).await?;
            metrics::counter!("saga_failed_total").increment(1);
            tracing::warn!(reason, "saga failed with nothing to compensate");
            return Ok(());
        }

        saga.start_compensation(reason, failed_step)?;
        self.persist(saga, Vec::new()).await?;
        tracing::info!(reason, failed_step = ?failed_step, "saga compensating");
        self.compensate(saga).await
    }

    /// Runs every outstanding undo action, persisting after each one, then
    /// settles the saga as `COMPENSATED` or `COMPENSATION_FAILED`.
    ///
    /// Compensation calls bypass the circuit breakers.
    async fn compensate(&self, saga: &mut SagaInstance) -> Result<()> {
        let executor = RetryExecutor::new(self.config.compensation_retry.clone());
        let timeout = self.config.step_timeout;
        let saga_id = saga.id();
        let mut failed = Vec::new();

        for planned in compensation::plan(saga) {
            let label = planned.action.label();
            let capabilities = &self.capabilities;
            let action = &planned.action;

            let outcome = executor
                .execute(move || async move {
                    tokio::time::timeout(timeout, capabilities.undo(saga_id, action))
                        .await
                        .unwrap_or(Err(CapabilityError::Timeout(timeout)))
                })
                .await;

            let error = outcome.result.as_ref().err().map(ToString::to_string);
            match (&outcome.result, action) {
                (Ok(_), CompensationAction::ReleaseReservation { reservation_id }) => {
                    saga.compensation_data_mut()?
                        .released_reservations
                        .push(reservation_id.clone());
                }
                (Ok(refund_id), CompensationAction::RefundPayment { payment_id }) => {
                    let data = saga.compensation_data_mut()?;
                    data.refunded_payment_id = Some(payment_id.clone());
                    data.refund_id = refund_id.clone();
                }
                (Err(err), _) => {
                    tracing::warn!(
                        action = %label,
                        attempts = outcome.attempts,
                        error = %err,
                        "compensating action failed"
                    );
                    failed.push(label.clone());
                }
            }

            saga.record_compensation(CompensationRecord {
                step: planned.step,
                action: label,
                succeeded: outcome.is_success(),
                attempts: outcome.attempts,
                error,
                recorded_at: Utc::now(),
            })?;
            self.persist(saga, Vec::new()).await?;
        }

        let mut touched: Vec<SagaStep> = saga.completed_steps().iter().rev().copied().collect();
        if !saga.saga_data().reservations.is_empty() {
            touched.push(SagaStep::StockReserved);
        }
        for step in touched {
            if step.is_compensable() && compensation::step_settled(saga, step) {
                saga.mark_step_compensated(step)?;
            }
        }

        if failed.is_empty() {
            saga.mark_compensated()?;
            let reason = saga
                .compensation_data()
                .reason
                .clone()
                .unwrap_or_else(|| REASON_CANCELLED.to_string());
            let event = NewOutboxEvent::order_cancelled(saga, &reason);
            self.persist(saga, vec![event]).await?;
            metrics::counter!("saga_compensated_total").increment(1);
            tracing::info!(reason = %reason, "saga compensated");
        } else {
            let summary = failed.join(", ");
            saga.mark_compensation_failed(format!("compensation failed: {summary}"))?;
            let event = NewOutboxEvent::order_compensation_failed(saga);
            self.persist(saga, vec![event]).await?;
            metrics::counter!("saga_compensation_failed_total").increment(1);
            tracing::error!(
                failed_actions = %summary,
                "saga compensation failed; operator action required"
            );
        }
        Ok(())
    }
}

fn execution_result(saga: &SagaInstance, started: Instant) -> SagaExecutionResult {
    SagaExecutionResult {
        correlation_id: saga.correlation_id().clone(),
        final_status: saga.status(),
        total_duration: started.elapsed(),
        compensation_executed: matches!(
            saga.status(),
            SagaStatus::Compensating | SagaStatus::Compensated | SagaStatus::CompensationFailed
        ),
        step_metrics: saga.saga_data().step_metrics.clone(),
    }
}
