//! WorkflowStore trait definition
//!
//! The store exclusively owns persistent mutation of runs, steps, logs and
//! outbox events. All other components hold transient copies keyed by id.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint was violated (duplicate run id, duplicate
    /// (run_id, seq, step_name) tuple, ...)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// Outbox event not found
    #[error("outbox event not found: {0}")]
    EventNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created, no step claimed yet
    Pending,

    /// At least one step has been claimed
    Running,

    /// All steps completed and the plan produced no successors
    Completed,

    /// A step failed terminally
    Failed,

    /// Run was cancelled by the host
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Step status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StepStatus {
    /// Terminal statuses never transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outbox event state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    InFlight,
    Published,
    Failed,
}

impl std::fmt::Display for OutboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in_flight"),
            Self::Published => write!(f, "published"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A new run to insert
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: Uuid,
    pub workflow_type: String,
    pub workflow_version: String,
    pub payload: serde_json::Value,
}

/// A workflow run as stored
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_type: String,
    pub workflow_version: String,
    pub status: RunStatus,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A new step to insert
#[derive(Debug, Clone)]
pub struct NewStep {
    pub run_id: Uuid,
    pub step_name: String,
    pub seq: i32,
    pub input: serde_json::Value,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
}

impl NewStep {
    /// Default attempt budget for steps that do not override it
    pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

    pub fn new(run_id: Uuid, step_name: impl Into<String>, seq: i32, input: serde_json::Value) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            seq,
            input,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            idempotency_key: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A workflow step as stored
///
/// `attempts` counts finished executions (success, failure, or crash
/// requeue), not claims.
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_name: String,
    pub seq: i32,
    pub status: StepStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub idempotency_key: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A new outbox event to enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
}

impl NewOutboxEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// An outbox event as stored
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub state: OutboxState,
    pub idempotency_key: Option<String>,
    pub published: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A new diagnostic log entry
#[derive(Debug, Clone)]
pub struct NewStepLog {
    pub step_id: Uuid,
    pub level: String,
    pub message: String,
    pub meta: serde_json::Value,
}

impl NewStepLog {
    pub fn warn(step_id: Uuid, message: impl Into<String>, meta: serde_json::Value) -> Self {
        Self {
            step_id,
            level: "warn".to_string(),
            message: message.into(),
            meta,
        }
    }

    pub fn info(step_id: Uuid, message: impl Into<String>, meta: serde_json::Value) -> Self {
        Self {
            step_id,
            level: "info".to_string(),
            message: message.into(),
            meta,
        }
    }
}

/// A stored log entry
#[derive(Debug, Clone)]
pub struct StepLog {
    pub id: Uuid,
    pub step_id: Uuid,
    pub level: String,
    pub message: String,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Everything committed when a step succeeds
///
/// The terminal update, outbox events, and successor steps ride one
/// transaction: either the completion and all of its side effects persist,
/// or none of them do. Successor tuples that already exist are ignored so a
/// deterministic replan after a crash is idempotent.
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub step_id: Uuid,
    pub result: serde_json::Value,
    pub events: Vec<NewOutboxEvent>,
    pub successors: Vec<NewStep>,
}

impl StepCompletion {
    pub fn new(step_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            step_id,
            result,
            events: vec![],
            successors: vec![],
        }
    }

    pub fn with_events(mut self, events: Vec<NewOutboxEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_successors(mut self, successors: Vec<NewStep>) -> Self {
        self.successors = successors;
        self
    }
}

/// Store for workflow runs, steps, logs and outbox events
///
/// This trait defines the interface for persisting workflow state.
/// Implementations must be thread-safe and support concurrent access; in
/// particular [`claim_next_step`](WorkflowStore::claim_next_step) must never
/// hand the same row to two concurrent callers.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Run Operations
    // =========================================================================

    /// Create a new run. Fails with [`StoreError::Conflict`] if the id exists.
    async fn create_run(&self, run: &NewRun) -> Result<(), StoreError>;

    /// Load a run by id. `None` for missing.
    async fn load_run(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError>;

    /// Update a run's status
    async fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), StoreError>;

    /// Load all steps of a run, ordered by (seq, created_at)
    async fn load_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError>;

    // =========================================================================
    // Step Queue Operations
    // =========================================================================

    /// Bulk-insert steps, all-or-nothing. Duplicate (run_id, seq, step_name)
    /// tuples fail the whole batch with [`StoreError::Conflict`].
    async fn insert_steps(&self, steps: &[NewStep]) -> Result<(), StoreError>;

    /// Atomically claim the next pending step
    ///
    /// Selects one claimable step (status pending and `next_attempt_at`
    /// absent or due) with minimal (seq, created_at), marks it in_progress
    /// with this worker as lock owner, and stamps claimed_at/last_heartbeat.
    /// Returns `None` when nothing is claimable.
    ///
    /// Uses SELECT FOR UPDATE SKIP LOCKED so concurrent claimers contend on
    /// different rows instead of each other.
    async fn claim_next_step(&self, worker_id: &str) -> Result<Option<WorkflowStep>, StoreError>;

    /// Write back a step's status, result, attempts, next_attempt_at,
    /// lock_owner and error. Does not check prior status; the caller holds
    /// the claim.
    async fn update_step(&self, step: &WorkflowStep) -> Result<(), StoreError>;

    /// Commit a successful step: terminal update (attempts incremented
    /// server-side), successor inserts, and outbox enqueues in one
    /// transaction. See [`StepCompletion`].
    async fn complete_step(&self, completion: StepCompletion) -> Result<(), StoreError>;

    /// Record a step heartbeat. Only meaningful while in_progress.
    async fn heartbeat_step(&self, step_id: Uuid) -> Result<(), StoreError>;

    /// Append a diagnostic log entry
    async fn append_log(&self, log: &NewStepLog) -> Result<(), StoreError>;

    /// Reclaim in_progress steps whose last_heartbeat is older than the TTL
    /// (or null). For each: attempts += 1; if attempts reached max_attempts
    /// the step fails terminally, otherwise it returns to pending with
    /// `next_attempt_at = now + backoff(attempts)`. Lock metadata is
    /// cleared. Returns the number of steps transitioned.
    async fn requeue_stale_steps(
        &self,
        heartbeat_ttl: Duration,
        limit: i64,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Outbox Operations
    // =========================================================================

    /// Enqueue an outbox event. An idempotency-key collision is a success
    /// no-op: exactly one row persists per key.
    async fn enqueue_event(&self, event: &NewOutboxEvent) -> Result<(), StoreError>;

    /// Transactionally flip up to `limit` pending events to in_flight,
    /// oldest first, and return them. Safe under concurrent publishers.
    async fn claim_pending_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Mark an in_flight event published
    async fn mark_event_published(&self, id: Uuid) -> Result<(), StoreError>;

    /// Mark an in_flight event failed, recording the delivery error.
    /// Failed events are kept for inspection; re-enqueue is explicit.
    async fn mark_event_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;
}
