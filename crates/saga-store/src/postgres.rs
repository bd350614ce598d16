use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, IdempotencyKey, Version};
use domain::{
    CompensationData, DomainError, NewOutboxEvent, OutboxEvent, SagaData, SagaInstance,
    SagaInstanceParts, SagaStatus, SagaStep,
};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{OutboxStore, SagaStore},
};

const SAGA_COLUMNS: &str = "id, saga_type, correlation_id, status, current_step, step_sequence, \
     saga_data, compensation_data, completed_steps, failed_steps, compensated_steps, \
     retry_count, max_retries, next_step_at, started_at, completed_at, failed_at, \
     failure_reason, last_error, expires_at, updated_at, version";

const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, event_data, \
     sequence_number, idempotency_key, processed, processed_at, retry_count, max_retries, \
     next_retry_at, last_error, correlation_id, created_at";

/// PostgreSQL-backed saga and outbox store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<SagaInstance> {
        let status: String = row.try_get("status")?;
        let current_step: Option<String> = row.try_get("current_step")?;

        let parts = SagaInstanceParts {
            id: AggregateId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            correlation_id: CorrelationId::new(row.try_get::<String, _>("correlation_id")?),
            status: status.parse::<SagaStatus>()?,
            current_step: current_step
                .map(|s| s.parse::<SagaStep>())
                .transpose()?,
            step_sequence: to_u32("step_sequence", row.try_get("step_sequence")?)?,
            saga_data: SagaData::decode(row.try_get("saga_data")?)?,
            compensation_data: CompensationData::decode(row.try_get("compensation_data")?)?,
            completed_steps: parse_steps(row.try_get("completed_steps")?)?,
            failed_steps: parse_steps(row.try_get("failed_steps")?)?,
            compensated_steps: parse_steps(row.try_get("compensated_steps")?)?,
            retry_count: to_u32("retry_count", row.try_get("retry_count")?)?,
            max_retries: to_u32("max_retries", row.try_get("max_retries")?)?,
            next_step_at: row.try_get("next_step_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            failure_reason: row.try_get("failure_reason")?,
            last_error: row.try_get("last_error")?,
            expires_at: row.try_get("expires_at")?,
            updated_at: row.try_get("updated_at")?,
            version: Version::new(row.try_get("version")?),
        };

        Ok(SagaInstance::from_parts(parts))
    }

    fn row_to_event(row: PgRow) -> Result<OutboxEvent> {
        Ok(OutboxEvent {
            id: AggregateId::from_uuid(row.try_get::<Uuid, _>("id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            sequence_number: row.try_get("sequence_number")?,
            idempotency_key: IdempotencyKey::from(row.try_get::<String, _>("idempotency_key")?),
            processed: row.try_get("processed")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: to_u32("retry_count", row.try_get("retry_count")?)?,
            max_retries: to_u32("max_retries", row.try_get("max_retries")?)?,
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            correlation_id: row
                .try_get::<Option<String>, _>("correlation_id")?
                .map(CorrelationId::new),
            created_at: row.try_get("created_at")?,
        })
    }

    /// Inserts one outbox row with the next sequence number of its aggregate.
    ///
    /// Returns `None` if the idempotency key already exists.
    async fn insert_event(
        conn: &mut PgConnection,
        event: NewOutboxEvent,
    ) -> Result<Option<OutboxEvent>> {
        // Serializes sequence allocation per aggregate for the rest of the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(event.aggregate_id.as_uuid())
            .execute(&mut *conn)
            .await?;

        let sql = format!(
            r#"
            INSERT INTO outbox_events
                (id, aggregate_type, aggregate_id, event_type, event_data, sequence_number,
                 idempotency_key, max_retries, correlation_id, created_at)
            VALUES (
                $1, $2, $3, $4, $5,
                COALESCE((SELECT MAX(sequence_number) FROM outbox_events WHERE aggregate_id = $3), 0) + 1,
                $6, $7, $8, NOW()
            )
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&event.aggregate_type)
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.event_type)
            .bind(&event.event_data)
            .bind(event.idempotency_key.as_str())
            .bind(event.max_retries as i32)
            .bind(event.correlation_id.as_ref().map(CorrelationId::as_str))
            .fetch_optional(&mut *conn)
            .await?;

        if row.is_none() {
            tracing::debug!(key = %event.idempotency_key, "outbox key exists, skipping");
        }
        row.map(Self::row_to_event).transpose()
    }

    async fn insert_events(
        conn: &mut PgConnection,
        events: Vec<NewOutboxEvent>,
    ) -> Result<Vec<OutboxEvent>> {
        let mut written = Vec::with_capacity(events.len());
        for event in events {
            if let Some(stored) = Self::insert_event(&mut *conn, event).await? {
                written.push(stored);
            }
        }
        Ok(written)
    }
}

fn to_u32(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        StoreError::InvalidRecord(DomainError::InvalidDocument {
            document: "saga row",
            reason: format!("{column} is negative: {value}"),
        })
    })
}

fn parse_steps(values: Vec<String>) -> Result<Vec<SagaStep>> {
    values
        .iter()
        .map(|s| s.parse::<SagaStep>().map_err(StoreError::from))
        .collect()
}

fn step_names(steps: &[SagaStep]) -> Vec<String> {
    steps.iter().map(|s| s.as_str().to_string()).collect()
}

fn status_names(filter: impl Fn(SagaStatus) -> bool) -> Vec<String> {
    SagaStatus::ALL
        .into_iter()
        .filter(|s| filter(*s))
        .map(|s| s.as_str().to_string())
        .collect()
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[tracing::instrument(skip(self, saga, events), fields(correlation_id = %saga.correlation_id()))]
    async fn create(&self, saga: &SagaInstance, events: Vec<NewOutboxEvent>) -> Result<Version> {
        let version = Version::initial().next();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO saga_instances ({SAGA_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22)
            "#
        );

        sqlx::query(&sql)
            .bind(saga.id().as_uuid())
            .bind(saga.saga_type())
            .bind(saga.correlation_id().as_str())
            .bind(saga.status().as_str())
            .bind(saga.current_step().map(|s| s.as_str()))
            .bind(saga.step_sequence() as i32)
            .bind(saga.saga_data().encode()?)
            .bind(saga.compensation_data().encode()?)
            .bind(step_names(saga.completed_steps()))
            .bind(step_names(saga.failed_steps()))
            .bind(step_names(saga.compensated_steps()))
            .bind(saga.retry_count() as i32)
            .bind(saga.max_retries() as i32)
            .bind(saga.next_step_at())
            .bind(saga.started_at())
            .bind(saga.completed_at())
            .bind(saga.failed_at())
            .bind(saga.failure_reason())
            .bind(saga.last_error())
            .bind(saga.expires_at())
            .bind(saga.updated_at())
            .bind(version.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_saga_correlation_id")
                {
                    return StoreError::DuplicateCorrelationId(saga.correlation_id().clone());
                }
                StoreError::Database(e)
            })?;

        Self::insert_events(&mut *tx, events).await?;

        tx.commit().await?;
        Ok(version)
    }

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>> {
        let sql = format!("SELECT {SAGA_COLUMNS} FROM saga_instances WHERE correlation_id = $1");
        let row = sqlx::query(&sql)
            .bind(correlation_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_saga).transpose()
    }

    #[tracing::instrument(skip(self, saga, events), fields(correlation_id = %saga.correlation_id(), status = %saga.status()))]
    async fn update(&self, saga: &SagaInstance, events: Vec<NewOutboxEvent>) -> Result<Version> {
        let expected = saga.version();
        let mut tx = self.pool.begin().await?;

        let new_version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE saga_instances SET
                status = $3,
                current_step = $4,
                step_sequence = $5,
                saga_data = $6,
                compensation_data = $7,
                completed_steps = $8,
                failed_steps = $9,
                compensated_steps = $10,
                retry_count = $11,
                max_retries = $12,
                next_step_at = $13,
                completed_at = $14,
                failed_at = $15,
                failure_reason = $16,
                last_error = $17,
                expires_at = $18,
                updated_at = $19,
                version = version + 1
            WHERE correlation_id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(saga.correlation_id().as_str())
        .bind(expected.as_i64())
        .bind(saga.status().as_str())
        .bind(saga.current_step().map(|s| s.as_str()))
        .bind(saga.step_sequence() as i32)
        .bind(saga.saga_data().encode()?)
        .bind(saga.compensation_data().encode()?)
        .bind(step_names(saga.completed_steps()))
        .bind(step_names(saga.failed_steps()))
        .bind(step_names(saga.compensated_steps()))
        .bind(saga.retry_count() as i32)
        .bind(saga.max_retries() as i32)
        .bind(saga.next_step_at())
        .bind(saga.completed_at())
        .bind(saga.failed_at())
        .bind(saga.failure_reason())
        .bind(saga.last_error())
        .bind(saga.expires_at())
        .bind(saga.updated_at())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(new_version) = new_version else {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM saga_instances WHERE correlation_id = $1")
                    .bind(saga.correlation_id().as_str())
                    .fetch_optional(&mut *tx)
                    .await?;

            return Err(match actual {
                None => StoreError::SagaNotFound(saga.correlation_id().clone()),
                Some(actual) => StoreError::ConcurrencyConflict {
                    correlation_id: saga.correlation_id().clone(),
                    expected,
                    actual: Version::new(actual),
                },
            });
        };

        Self::insert_events(&mut *tx, events).await?;

        tx.commit().await?;
        Ok(Version::new(new_version))
    }

    async fn find_resumable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>> {
        let sql = format!(
            r#"
            SELECT {SAGA_COLUMNS} FROM saga_instances
            WHERE (status = ANY($1) AND (next_step_at IS NULL OR next_step_at <= $3))
               OR (status = ANY($2) AND expires_at <= $3)
            ORDER BY updated_at ASC
            LIMIT $4
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(status_names(|s| s.is_resumable()))
            .bind(status_names(|s| !s.is_terminal()))
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn find_by_status(&self, status: SagaStatus, limit: usize) -> Result<Vec<SagaInstance>> {
        let sql = format!(
            "SELECT {SAGA_COLUMNS} FROM saga_instances WHERE status = $1 ORDER BY updated_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }

    async fn try_acquire_lease(
        &self,
        correlation_id: &CorrelationId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO saga_leases (correlation_id, owner, locked_until)
            VALUES ($1, $2, $3)
            ON CONFLICT (correlation_id) DO UPDATE
                SET owner = EXCLUDED.owner, locked_until = EXCLUDED.locked_until
                WHERE saga_leases.locked_until <= $4 OR saga_leases.owner = EXCLUDED.owner
            "#,
        )
        .bind(correlation_id.as_str())
        .bind(owner)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, correlation_id: &CorrelationId, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM saga_leases WHERE correlation_id = $1 AND owner = $2")
            .bind(correlation_id.as_str())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresSagaStore {
    async fn append(&self, events: Vec<NewOutboxEvent>) -> Result<Vec<OutboxEvent>> {
        let mut tx = self.pool.begin().await?;
        let written = Self::insert_events(&mut *tx, events).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn claim_batch(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>> {
        let sql = format!(
            r#"
            UPDATE outbox_events SET claimed_by = $1, claimed_until = $2
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE processed = FALSE
                  AND retry_count < max_retries
                  AND (next_retry_at IS NULL OR next_retry_at <= $3)
                  AND (claimed_until IS NULL OR claimed_until < $3)
                ORDER BY created_at ASC, sequence_number ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(owner)
            .bind(lease_until)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut events = rows
            .into_iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>>>()?;
        events.sort_by_key(|e| (e.created_at, e.sequence_number));
        Ok(events)
    }

    async fn mark_processed(&self, id: AggregateId, note: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events SET
                processed = TRUE,
                processed_at = NOW(),
                last_error = COALESCE($2, last_error),
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .bind(note)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM outbox_events WHERE id = $1)")
                .bind(id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::OutboxEventNotFound(id))
        }
    }

    async fn record_failure(
        &self,
        id: AggregateId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<OutboxEvent> {
        let sql = format!(
            r#"
            UPDATE outbox_events SET
                retry_count = retry_count + 1,
                last_error = $2,
                next_retry_at = $3,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(error)
            .bind(next_retry_at)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::OutboxEventNotFound(id))?;

        Self::row_to_event(row)
    }

    async fn get_event(&self, id: AggregateId) -> Result<Option<OutboxEvent>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_event).transpose()
    }

    async fn events_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEvent>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE aggregate_id = $1 ORDER BY sequence_number ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(aggregate_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn parked(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS} FROM outbox_events
            WHERE processed = FALSE AND retry_count >= max_retries
            ORDER BY created_at ASC
            LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn pending_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE processed = FALSE")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}
