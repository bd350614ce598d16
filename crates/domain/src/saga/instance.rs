//! The persisted saga instance.

use chrono::{DateTime, Duration, Utc};
use common::{AggregateId, CorrelationId, Version};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::saga::{
    CompensationData, CompensationRecord, SagaData, SagaStatus, SagaStep, StepErrorRecord,
    StepMetric, step::ORDER_FULFILLMENT,
};

/// One run of the order fulfillment saga.
///
/// Only the orchestrator that owns the correlation ID mutates an instance,
/// and every mutation goes through a method that enforces the status state
/// machine. Once terminal, the instance is frozen and kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    id: AggregateId,
    saga_type: String,
    correlation_id: CorrelationId,
    status: SagaStatus,
    current_step: Option<SagaStep>,
    step_sequence: u32,
    saga_data: SagaData,
    compensation_data: CompensationData,
    completed_steps: Vec<SagaStep>,
    failed_steps: Vec<SagaStep>,
    compensated_steps: Vec<SagaStep>,
    retry_count: u32,
    max_retries: u32,
    next_step_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    last_error: Option<String>,
    expires_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: Version,
}

/// Every field of a [`SagaInstance`], used by stores to rebuild a row.
#[derive(Debug, Clone)]
pub struct SagaInstanceParts {
    pub id: AggregateId,
    pub saga_type: String,
    pub correlation_id: CorrelationId,
    pub status: SagaStatus,
    pub current_step: Option<SagaStep>,
    pub step_sequence: u32,
    pub saga_data: SagaData,
    pub compensation_data: CompensationData,
    pub completed_steps: Vec<SagaStep>,
    pub failed_steps: Vec<SagaStep>,
    pub compensated_steps: Vec<SagaStep>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_step_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub last_error: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: Version,
}

impl SagaInstance {
    /// Creates a new saga in `STARTED`.
    pub fn new(
        correlation_id: CorrelationId,
        saga_data: SagaData,
        max_retries: u32,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AggregateId::new(),
            saga_type: ORDER_FULFILLMENT.to_string(),
            correlation_id,
            status: SagaStatus::Started,
            current_step: None,
            step_sequence: 0,
            saga_data,
            compensation_data: CompensationData::default(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            retry_count: 0,
            max_retries,
            next_step_at: None,
            started_at: now,
            completed_at: None,
            failed_at: None,
            failure_reason: None,
            last_error: None,
            expires_at: now + ttl,
            updated_at: now,
            version: Version::initial(),
        }
    }

    /// Rebuilds an instance from stored fields.
    pub fn from_parts(parts: SagaInstanceParts) -> Self {
        Self {
            id: parts.id,
            saga_type: parts.saga_type,
            correlation_id: parts.correlation_id,
            status: parts.status,
            current_step: parts.current_step,
            step_sequence: parts.step_sequence,
            saga_data: parts.saga_data,
            compensation_data: parts.compensation_data,
            completed_steps: parts.completed_steps,
            failed_steps: parts.failed_steps,
            compensated_steps: parts.compensated_steps,
            retry_count: parts.retry_count,
            max_retries: parts.max_retries,
            next_step_at: parts.next_step_at,
            started_at: parts.started_at,
            completed_at: parts.completed_at,
            failed_at: parts.failed_at,
            failure_reason: parts.failure_reason,
            last_error: parts.last_error,
            expires_at: parts.expires_at,
            updated_at: parts.updated_at,
            version: parts.version,
        }
    }

    fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DomainError::Terminal {
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DomainError::Terminal {
                status: self.status,
            });
        }
        Ok(())
    }

    /// Enters `step`: sets it current, bumps the sequence and moves to `RUNNING`.
    pub fn begin_step(&mut self, step: SagaStep) -> Result<()> {
        self.transition(SagaStatus::Running)?;
        self.current_step = Some(step);
        self.step_sequence += 1;
        self.next_step_at = None;
        Ok(())
    }

    /// Records a successful step and resets the retry counter.
    pub fn complete_step(&mut self, metric: StepMetric) -> Result<()> {
        self.ensure_mutable()?;
        if self.status != SagaStatus::Running {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: SagaStatus::Running,
            });
        }
        if !self.completed_steps.contains(&metric.step) {
            self.completed_steps.push(metric.step);
        }
        self.saga_data.step_metrics.push(metric);
        self.retry_count = 0;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Records a failed step attempt with its metric and error.
    pub fn record_step_failure(&mut self, metric: StepMetric, error: StepErrorRecord) -> Result<()> {
        self.ensure_mutable()?;
        self.failed_steps.push(metric.step);
        self.saga_data.step_metrics.push(metric);
        self.last_error = Some(error.message.clone());
        self.saga_data.errors.push(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Records the error of a step attempt that will be retried later.
    ///
    /// Leaves the step metrics and failed steps alone; the step gets its one
    /// metric once it finally succeeds or fails for good.
    pub fn record_step_error(&mut self, error: StepErrorRecord) -> Result<()> {
        self.ensure_mutable()?;
        self.last_error = Some(error.message.clone());
        self.saga_data.errors.push(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves to `RETRYING`, consuming one unit of the saga retry budget.
    pub fn schedule_retry(&mut self, next_step_at: DateTime<Utc>) -> Result<()> {
        self.transition(SagaStatus::Retrying)?;
        self.retry_count += 1;
        self.next_step_at = Some(next_step_at);
        Ok(())
    }

    /// Returns true while the saga retry budget is not used up.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Moves to `COMPENSATING`.
    pub fn start_compensation(
        &mut self,
        reason: impl Into<String>,
        failed_step: Option<SagaStep>,
    ) -> Result<()> {
        self.transition(SagaStatus::Compensating)?;
        let reason = reason.into();
        self.compensation_data.reason = Some(reason.clone());
        self.compensation_data.failed_step = failed_step;
        self.failure_reason = Some(reason);
        self.next_step_at = None;
        Ok(())
    }

    /// Appends the outcome of a compensating action.
    pub fn record_compensation(&mut self, record: CompensationRecord) -> Result<()> {
        self.ensure_mutable()?;
        if !record.succeeded {
            self.last_error = record.error.clone();
        }
        self.compensation_data.actions.push(record);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks a step as fully undone.
    pub fn mark_step_compensated(&mut self, step: SagaStep) -> Result<()> {
        self.ensure_mutable()?;
        if !self.compensated_steps.contains(&step) {
            self.compensated_steps.push(step);
        }
        Ok(())
    }

    /// `COMPENSATING` -> `COMPENSATED`.
    pub fn mark_compensated(&mut self) -> Result<()> {
        self.transition(SagaStatus::Compensated)?;
        self.failed_at = Some(Utc::now());
        Ok(())
    }

    /// `COMPENSATING` -> `COMPENSATION_FAILED`.
    pub fn mark_compensation_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(SagaStatus::CompensationFailed)?;
        self.last_error = Some(error.into());
        self.failed_at = Some(Utc::now());
        Ok(())
    }

    /// `RUNNING` -> `COMPLETED`.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(SagaStatus::Completed)?;
        self.current_step = Some(SagaStep::Confirmed);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `RUNNING` -> `FAILED`, for failures that left nothing to undo.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(SagaStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        self.failed_at = Some(Utc::now());
        Ok(())
    }

    /// Returns the step the forward path should run next.
    pub fn next_step(&self) -> Option<SagaStep> {
        SagaStep::TOPOLOGY
            .into_iter()
            .find(|step| !self.completed_steps.contains(step))
    }

    /// Returns true if every step of the topology completed.
    pub fn all_steps_completed(&self) -> bool {
        self.next_step().is_none()
    }

    /// Returns true if a retry is scheduled for later than `now`.
    pub fn is_waiting(&self, now: DateTime<Utc>) -> bool {
        self.status == SagaStatus::Retrying && self.next_step_at.is_some_and(|at| at > now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at <= now
    }

    /// Gives mutable access to the forward payload so steps can record outputs.
    pub fn saga_data_mut(&mut self) -> Result<&mut SagaData> {
        self.ensure_mutable()?;
        Ok(&mut self.saga_data)
    }

    /// Gives mutable access to the compensation payload.
    pub fn compensation_data_mut(&mut self) -> Result<&mut CompensationData> {
        self.ensure_mutable()?;
        Ok(&mut self.compensation_data)
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn current_step(&self) -> Option<SagaStep> {
        self.current_step
    }

    pub fn step_sequence(&self) -> u32 {
        self.step_sequence
    }

    pub fn saga_data(&self) -> &SagaData {
        &self.saga_data
    }

    pub fn compensation_data(&self) -> &CompensationData {
        &self.compensation_data
    }

    pub fn completed_steps(&self) -> &[SagaStep] {
        &self.completed_steps
    }

    pub fn failed_steps(&self) -> &[SagaStep] {
        &self.failed_steps
    }

    pub fn compensated_steps(&self) -> &[SagaStep] {
        &self.compensated_steps
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn next_step_at(&self) -> Option<DateTime<Utc>> {
        self.next_step_at
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{Money, OrderItem, UserId};

    fn new_saga() -> SagaInstance {
        let data = SagaData::new(
            AggregateId::new(),
            UserId::new(),
            vec![OrderItem::new("P1", 2, Money::from_cents(1000))],
        )
        .unwrap();
        SagaInstance::new(CorrelationId::new("corr-1"), data, 3, Duration::hours(24))
    }

    fn error(step: SagaStep) -> StepErrorRecord {
        StepErrorRecord {
            step,
            kind: "transient".to_string(),
            message: "connection reset".to_string(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_saga_is_started() {
        let saga = new_saga();
        assert_eq!(saga.status(), SagaStatus::Started);
        assert_eq!(saga.saga_type(), ORDER_FULFILLMENT);
        assert_eq!(saga.next_step(), Some(SagaStep::StockVerified));
        assert_eq!(saga.version(), Version::initial());
        assert!(saga.expires_at() > saga.started_at());
    }

    #[test]
    fn test_begin_step_moves_to_running_and_counts() {
        let mut saga = new_saga();
        saga.begin_step(SagaStep::StockVerified).unwrap();
        assert_eq!(saga.status(), SagaStatus::Running);
        assert_eq!(saga.current_step(), Some(SagaStep::StockVerified));
        assert_eq!(saga.step_sequence(), 1);
    }

    #[test]
    fn test_success_resets_retry_count() {
        let mut saga = new_saga();
        saga.begin_step(SagaStep::StockVerified).unwrap();
        saga.schedule_retry(Utc::now()).unwrap();
        assert_eq!(saga.retry_count(), 1);
        assert!(saga.next_step_at().is_some());

        saga.begin_step(SagaStep::StockVerified).unwrap();
        assert!(saga.next_step_at().is_none());
        saga.complete_step(StepMetric::new(SagaStep::StockVerified, 5, true, 1))
            .unwrap();
        assert_eq!(saga.retry_count(), 0);
        assert_eq!(saga.completed_steps(), &[SagaStep::StockVerified]);
        assert_eq!(saga.next_step(), Some(SagaStep::StockReserved));
    }

    #[test]
    fn test_retry_budget() {
        let mut saga = new_saga();
        for _ in 0..3 {
            assert!(saga.has_retry_budget());
            saga.begin_step(SagaStep::StockVerified).unwrap();
            saga.schedule_retry(Utc::now()).unwrap();
        }
        assert!(!saga.has_retry_budget());
    }

    #[test]
    fn test_failure_records_error_and_metric() {
        let mut saga = new_saga();
        saga.begin_step(SagaStep::StockVerified).unwrap();
        saga.record_step_failure(
            StepMetric::new(SagaStep::StockVerified, 10, false, 3),
            error(SagaStep::StockVerified),
        )
        .unwrap();
        assert_eq!(saga.failed_steps(), &[SagaStep::StockVerified]);
        assert_eq!(saga.last_error(), Some("connection reset"));
        assert_eq!(saga.saga_data().step_metrics[0].retries, 2);
        assert_eq!(saga.saga_data().errors.len(), 1);
    }

    #[test]
    fn test_retried_step_error_leaves_metrics_alone() {
        let mut saga = new_saga();
        saga.begin_step(SagaStep::StockVerified).unwrap();
        saga.record_step_error(error(SagaStep::StockVerified)).unwrap();
        saga.schedule_retry(Utc::now()).unwrap();

        assert!(saga.failed_steps().is_empty());
        assert!(saga.saga_data().step_metrics.is_empty());
        assert_eq!(saga.saga_data().errors.len(), 1);
        assert_eq!(saga.last_error(), Some("connection reset"));
    }

    #[test]
    fn test_compensation_path() {
        let mut saga = new_saga();
        saga.begin_step(SagaStep::StockVerified).unwrap();
        saga.start_compensation("fraud_detected", Some(SagaStep::PaymentProcessing))
            .unwrap();
        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert_eq!(saga.failure_reason(), Some("fraud_detected"));
        assert_eq!(
            saga.compensation_data().failed_step,
            Some(SagaStep::PaymentProcessing)
        );
        saga.mark_step_compensated(SagaStep::StockReserved).unwrap();
        saga.mark_compensated().unwrap();
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert!(saga.failed_at().is_some());
    }

    #[test]
    fn test_terminal_saga_is_frozen() {
        let mut saga = new_saga();
        saga.begin_step(SagaStep::StockVerified).unwrap();
        saga.complete().unwrap();

        assert!(matches!(
            saga.begin_step(SagaStep::StockReserved),
            Err(DomainError::Terminal { .. })
        ));
        assert!(saga.saga_data_mut().is_err());
        assert!(saga.fail("late").is_err());
    }

    #[test]
    fn test_cannot_complete_from_started() {
        let mut saga = new_saga();
        assert!(matches!(
            saga.complete(),
            Err(DomainError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_is_waiting_only_while_retrying() {
        let mut saga = new_saga();
        let later = Utc::now() + Duration::seconds(30);
        assert!(!saga.is_waiting(Utc::now()));
        saga.begin_step(SagaStep::StockVerified).unwrap();
        saga.schedule_retry(later).unwrap();
        assert!(saga.is_waiting(Utc::now()));
        assert!(!saga.is_waiting(later + Duration::seconds(1)));
    }

    #[test]
    fn test_expiry() {
        let saga = new_saga();
        assert!(!saga.is_expired(Utc::now()));
        assert!(saga.is_expired(saga.expires_at()));
    }
}
