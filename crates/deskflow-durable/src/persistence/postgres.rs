//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Row-level claiming via SELECT FOR UPDATE SKIP LOCKED
//! - Transactional step completion (terminal update + successors + outbox)
//! - Stale-claim recovery computed in a single statement
//!
//! Schema lives in `migrations/`; run them with `sqlx::migrate!` before
//! constructing the store.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

/// PostgreSQL implementation of WorkflowStore
///
/// Uses a connection pool for efficient database access. Safe under high
/// claim contention across many workers.
///
/// # Example
///
/// ```ignore
/// use deskflow_durable::PgWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/deskflow").await?;
/// let store = PgWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    #[instrument(skip(self, run), fields(run_id = %run.id))]
    async fn create_run(&self, run: &NewRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, workflow_type, workflow_version, status, payload)
            VALUES ($1, $2, $3, 'pending', $4)
            "#,
        )
        .bind(run.id)
        .bind(&run.workflow_type)
        .bind(&run.workflow_version)
        .bind(&run.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_database(e, || format!("run {} exists", run.id)))?;

        debug!(workflow_type = %run.workflow_type, "created run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_run(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, workflow_version, status, payload, created_at, updated_at
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load run: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.map(run_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update run status: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(id));
        }

        debug!(%status, "updated run status");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM workflow_steps
            WHERE run_id = $1
            ORDER BY seq, created_at
            "#,
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load steps: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.into_iter().map(step_from_row).collect()
    }

    #[instrument(skip(self, steps))]
    async fn insert_steps(&self, steps: &[NewStep]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps
                    (id, run_id, step_name, seq, status, input, max_attempts, idempotency_key)
                VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(step.run_id)
            .bind(&step.step_name)
            .bind(step.seq)
            .bind(&step.input)
            .bind(step.max_attempts)
            .bind(&step.idempotency_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                conflict_or_database(e, || {
                    format!("step ({}, {}, {}) exists", step.run_id, step.seq, step.step_name)
                })
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(count = steps.len(), "inserted steps");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_next_step(&self, worker_id: &str) -> Result<Option<WorkflowStep>, StoreError> {
        // SKIP LOCKED makes concurrent claimers contend on different rows:
        // two callers never receive the same step
        let row = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM workflow_steps
                WHERE status = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY seq, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_steps s
            SET status = 'in_progress',
                lock_owner = $1,
                claimed_at = NOW(),
                last_heartbeat = NOW(),
                updated_at = NOW()
            FROM next
            WHERE s.id = next.id
            RETURNING {PREFIXED_STEP_COLUMNS}
            "#,
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let step = row.map(step_from_row).transpose()?;
        if let Some(step) = &step {
            debug!(step_id = %step.id, step_name = %step.step_name, "claimed step");
        }
        Ok(step)
    }

    #[instrument(skip(self, step), fields(step_id = %step.id))]
    async fn update_step(&self, step: &WorkflowStep) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = $2,
                result = $3,
                attempts = $4,
                next_attempt_at = $5,
                lock_owner = $6,
                error = $7,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(step.id)
        .bind(step.status.to_string())
        .bind(&step.result)
        .bind(step.attempts)
        .bind(step.next_attempt_at)
        .bind(&step.lock_owner)
        .bind(&step.error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound(step.id));
        }

        debug!(status = %step.status, attempts = step.attempts, "updated step");
        Ok(())
    }

    #[instrument(skip(self, completion), fields(step_id = %completion.step_id))]
    async fn complete_step(&self, completion: StepCompletion) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'completed',
                result = $2,
                attempts = attempts + 1,
                error = NULL,
                lock_owner = NULL,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(completion.step_id)
        .bind(&completion.result)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound(completion.step_id));
        }

        // Deterministic replans may re-emit existing successors; those
        // tuples are ignored rather than rolling back the completion
        for successor in &completion.successors {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps
                    (id, run_id, step_name, seq, status, input, max_attempts, idempotency_key)
                VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
                ON CONFLICT (run_id, seq, step_name) DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(successor.run_id)
            .bind(&successor.step_name)
            .bind(successor.seq)
            .bind(&successor.input)
            .bind(successor.max_attempts)
            .bind(&successor.idempotency_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        for event in &completion.events {
            insert_event(&mut *tx, event).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(
            successors = completion.successors.len(),
            events = completion.events.len(),
            "completed step"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn heartbeat_step(&self, step_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET last_heartbeat = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(step_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to heartbeat step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self, log), fields(step_id = %log.step_id))]
    async fn append_log(&self, log: &NewStepLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO step_logs (id, step_id, level, message, meta)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(log.step_id)
        .bind(&log.level)
        .bind(&log.message)
        .bind(&log.meta)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to append log: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn requeue_stale_steps(
        &self,
        heartbeat_ttl: Duration,
        limit: i64,
    ) -> Result<u64, StoreError> {
        let ttl_secs = heartbeat_ttl.as_secs() as f64;

        // The backoff exponent uses the pre-increment attempt count:
        // new_attempts - 1 == s.attempts
        let result = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM workflow_steps
                WHERE status = 'in_progress'
                  AND (last_heartbeat IS NULL OR last_heartbeat < NOW() - make_interval(secs => $1))
                ORDER BY last_heartbeat NULLS FIRST
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_steps s
            SET attempts = s.attempts + 1,
                status = CASE WHEN s.attempts + 1 >= s.max_attempts
                              THEN 'failed' ELSE 'pending' END,
                error = CASE WHEN s.attempts + 1 >= s.max_attempts
                             THEN 'heartbeat expired' ELSE s.error END,
                next_attempt_at = CASE WHEN s.attempts + 1 >= s.max_attempts
                                       THEN NULL
                                       ELSE NOW() + make_interval(secs =>
                                            LEAST(GREATEST($1, 5) * POWER(2, s.attempts), 3600)) END,
                lock_owner = NULL,
                claimed_at = NULL,
                last_heartbeat = NULL,
                updated_at = NOW()
            FROM stale
            WHERE s.id = stale.id
            "#,
        )
        .bind(ttl_secs)
        .bind(limit)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to requeue stale steps: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let count = result.rows_affected();
        if count > 0 {
            debug!(count, "requeued stale steps");
        }
        Ok(count)
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    async fn enqueue_event(&self, event: &NewOutboxEvent) -> Result<(), StoreError> {
        insert_event(&self.pool, event).await?;
        debug!("enqueued outbox event");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_pending_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH batch AS (
                SELECT id
                FROM outbox_events
                WHERE state = 'pending'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events e
            SET state = 'in_flight'
            FROM batch
            WHERE e.id = batch.id
            RETURNING e.id, e.event_type, e.payload, e.state, e.idempotency_key,
                      e.published, e.last_error, e.created_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim outbox events: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let events: Result<Vec<_>, _> = rows.into_iter().map(event_from_row).collect();
        let events = events?;
        if !events.is_empty() {
            debug!(count = events.len(), "claimed outbox events");
        }
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn mark_event_published(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET state = 'published', published = TRUE
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::EventNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_event_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET state = 'failed', last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::EventNotFound(id));
        }
        Ok(())
    }
}

// Helper functions

const STEP_COLUMNS: &str = "id, run_id, step_name, seq, status, input, result, attempts, \
     max_attempts, next_attempt_at, claimed_at, last_heartbeat, lock_owner, idempotency_key, \
     error, created_at, updated_at";

const PREFIXED_STEP_COLUMNS: &str = "s.id, s.run_id, s.step_name, s.seq, s.status, s.input, \
     s.result, s.attempts, s.max_attempts, s.next_attempt_at, s.claimed_at, s.last_heartbeat, \
     s.lock_owner, s.idempotency_key, s.error, s.created_at, s.updated_at";

async fn insert_event<'e, E>(executor: E, event: &NewOutboxEvent) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    // The partial unique index on idempotency_key makes a colliding enqueue
    // a no-op: exactly one row persists per key
    sqlx::query(
        r#"
        INSERT INTO outbox_events (id, event_type, payload, state, idempotency_key)
        VALUES ($1, $2, $3, 'pending', $4)
        ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(&event.idempotency_key)
    .execute(executor)
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;

    Ok(())
}

fn conflict_or_database(
    e: sqlx::Error,
    conflict_message: impl FnOnce() -> String,
) -> StoreError {
    let is_unique = e
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);

    if is_unique {
        StoreError::Conflict(conflict_message())
    } else {
        error!("Database error: {}", e);
        StoreError::Database(e.to_string())
    }
}

fn run_from_row(row: PgRow) -> Result<WorkflowRun, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowRun {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        workflow_version: row.get("workflow_version"),
        status: parse_run_status(&status)?,
        payload: row.get("payload"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn step_from_row(row: PgRow) -> Result<WorkflowStep, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowStep {
        id: row.get("id"),
        run_id: row.get("run_id"),
        step_name: row.get("step_name"),
        seq: row.get("seq"),
        status: parse_step_status(&status)?,
        input: row.get("input"),
        result: row.get("result"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        next_attempt_at: row.get("next_attempt_at"),
        claimed_at: row.get("claimed_at"),
        last_heartbeat: row.get("last_heartbeat"),
        lock_owner: row.get("lock_owner"),
        idempotency_key: row.get("idempotency_key"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn event_from_row(row: PgRow) -> Result<OutboxEvent, StoreError> {
    let state: String = row.get("state");
    Ok(OutboxEvent {
        id: row.get("id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        state: parse_outbox_state(&state)?,
        idempotency_key: row.get("idempotency_key"),
        published: row.get("published"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}

fn parse_run_status(status: &str) -> Result<RunStatus, StoreError> {
    match status {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        _ => Err(StoreError::Database(format!("unknown run status: {status}"))),
    }
}

fn parse_step_status(status: &str) -> Result<StepStatus, StoreError> {
    match status {
        "pending" => Ok(StepStatus::Pending),
        "in_progress" => Ok(StepStatus::InProgress),
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        _ => Err(StoreError::Database(format!("unknown step status: {status}"))),
    }
}

fn parse_outbox_state(state: &str) -> Result<OutboxState, StoreError> {
    match state {
        "pending" => Ok(OutboxState::Pending),
        "in_flight" => Ok(OutboxState::InFlight),
        "published" => Ok(OutboxState::Published),
        "failed" => Ok(OutboxState::Failed),
        _ => Err(StoreError::Database(format!("unknown outbox state: {state}"))),
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a PostgreSQL database; see
    // tests/postgres_integration_test.rs
}
