//! In-memory implementation of WorkflowStore for testing
//!
//! Not a throwaway mock: this store implements the full contract, including
//! timestamps, with the same semantics as the PostgreSQL store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::backoff::retry_delay;

/// In-memory implementation of WorkflowStore
///
/// Primarily for tests. All data lives in memory behind read/write locks and
/// every operation provides the same semantics as the PostgreSQL
/// implementation, including claim mutual exclusion.
///
/// # Example
///
/// ```
/// use deskflow_durable::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
pub struct InMemoryWorkflowStore {
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
    steps: RwLock<HashMap<Uuid, WorkflowStep>>,
    events: RwLock<HashMap<Uuid, OutboxEvent>>,
    logs: RwLock<Vec<StepLog>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            logs: RwLock::new(Vec::new()),
        }
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Get the number of pending steps
    pub fn pending_step_count(&self) -> usize {
        self.steps
            .read()
            .values()
            .filter(|s| s.status == StepStatus::Pending)
            .count()
    }

    /// Get the number of in-progress steps
    pub fn in_progress_step_count(&self) -> usize {
        self.steps
            .read()
            .values()
            .filter(|s| s.status == StepStatus::InProgress)
            .count()
    }

    /// Get the number of outbox events in a given state
    pub fn event_count(&self, state: OutboxState) -> usize {
        self.events
            .read()
            .values()
            .filter(|e| e.state == state)
            .count()
    }

    /// Get the number of log entries
    pub fn log_count(&self) -> usize {
        self.logs.read().len()
    }

    /// Get all log entries for a step
    pub fn logs_for_step(&self, step_id: Uuid) -> Vec<StepLog> {
        self.logs
            .read()
            .iter()
            .filter(|l| l.step_id == step_id)
            .cloned()
            .collect()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.runs.write().clear();
        self.steps.write().clear();
        self.events.write().clear();
        self.logs.write().clear();
    }

    fn step_tuple_exists(
        steps: &HashMap<Uuid, WorkflowStep>,
        run_id: Uuid,
        seq: i32,
        step_name: &str,
    ) -> bool {
        steps
            .values()
            .any(|s| s.run_id == run_id && s.seq == seq && s.step_name == step_name)
    }

    fn materialize(new: &NewStep) -> WorkflowStep {
        let now = Utc::now();
        WorkflowStep {
            id: Uuid::now_v7(),
            run_id: new.run_id,
            step_name: new.step_name.clone(),
            seq: new.seq,
            status: StepStatus::Pending,
            input: new.input.clone(),
            result: None,
            attempts: 0,
            max_attempts: new.max_attempts,
            next_attempt_at: None,
            claimed_at: None,
            last_heartbeat: None,
            lock_owner: None,
            idempotency_key: new.idempotency_key.clone(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn insert_event_locked(events: &mut HashMap<Uuid, OutboxEvent>, new: &NewOutboxEvent) {
        if let Some(key) = &new.idempotency_key {
            if events
                .values()
                .any(|e| e.idempotency_key.as_deref() == Some(key))
            {
                return;
            }
        }

        let event = OutboxEvent {
            id: Uuid::now_v7(),
            event_type: new.event_type.clone(),
            payload: new.payload.clone(),
            state: OutboxState::Pending,
            idempotency_key: new.idempotency_key.clone(),
            published: false,
            last_error: None,
            created_at: Utc::now(),
        };
        events.insert(event.id, event);
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_run(&self, run: &NewRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} exists", run.id)));
        }

        let now = Utc::now();
        runs.insert(
            run.id,
            WorkflowRun {
                id: run.id,
                workflow_type: run.workflow_type.clone(),
                workflow_version: run.workflow_version.clone(),
                status: RunStatus::Pending,
                payload: run.payload.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.runs.read().get(&id).cloned())
    }

    async fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        run.status = status;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn load_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>, StoreError> {
        let mut steps: Vec<_> = self
            .steps
            .read()
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| (a.seq, a.created_at).cmp(&(b.seq, b.created_at)));
        Ok(steps)
    }

    async fn insert_steps(&self, new_steps: &[NewStep]) -> Result<(), StoreError> {
        let mut steps = self.steps.write();

        // All-or-nothing: reject the whole batch on any duplicate tuple,
        // including duplicates within the batch itself
        for (i, new) in new_steps.iter().enumerate() {
            if Self::step_tuple_exists(&steps, new.run_id, new.seq, &new.step_name) {
                return Err(StoreError::Conflict(format!(
                    "step ({}, {}, {}) exists",
                    new.run_id, new.seq, new.step_name
                )));
            }
            for earlier in &new_steps[..i] {
                if earlier.run_id == new.run_id
                    && earlier.seq == new.seq
                    && earlier.step_name == new.step_name
                {
                    return Err(StoreError::Conflict(format!(
                        "duplicate step ({}, {}, {}) in batch",
                        new.run_id, new.seq, new.step_name
                    )));
                }
            }
        }

        for new in new_steps {
            let step = Self::materialize(new);
            steps.insert(step.id, step);
        }
        Ok(())
    }

    async fn claim_next_step(&self, worker_id: &str) -> Result<Option<WorkflowStep>, StoreError> {
        let now = Utc::now();
        let mut steps = self.steps.write();

        let next_id = steps
            .values()
            .filter(|s| {
                s.status == StepStatus::Pending
                    && s.next_attempt_at.map(|at| at <= now).unwrap_or(true)
            })
            .min_by(|a, b| (a.seq, a.created_at, a.id).cmp(&(b.seq, b.created_at, b.id)))
            .map(|s| s.id);

        let Some(id) = next_id else {
            return Ok(None);
        };

        let step = steps.get_mut(&id).expect("selected id present");
        step.status = StepStatus::InProgress;
        step.lock_owner = Some(worker_id.to_string());
        step.claimed_at = Some(now);
        step.last_heartbeat = Some(now);
        step.updated_at = now;
        Ok(Some(step.clone()))
    }

    async fn update_step(&self, update: &WorkflowStep) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let step = steps
            .get_mut(&update.id)
            .ok_or(StoreError::StepNotFound(update.id))?;

        step.status = update.status;
        step.result = update.result.clone();
        step.attempts = update.attempts;
        step.next_attempt_at = update.next_attempt_at;
        step.lock_owner = update.lock_owner.clone();
        step.error = update.error.clone();
        step.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_step(&self, completion: StepCompletion) -> Result<(), StoreError> {
        // Single write section stands in for the SQL transaction: the
        // terminal update, successors and events become visible together
        let mut steps = self.steps.write();
        let mut events = self.events.write();

        let step = steps
            .get_mut(&completion.step_id)
            .ok_or(StoreError::StepNotFound(completion.step_id))?;

        step.status = StepStatus::Completed;
        step.result = Some(completion.result.clone());
        step.attempts += 1;
        step.error = None;
        step.lock_owner = None;
        step.next_attempt_at = None;
        step.updated_at = Utc::now();

        for successor in &completion.successors {
            if Self::step_tuple_exists(&steps, successor.run_id, successor.seq, &successor.step_name)
            {
                continue;
            }
            let step = Self::materialize(successor);
            steps.insert(step.id, step);
        }

        for event in &completion.events {
            Self::insert_event_locked(&mut events, event);
        }

        Ok(())
    }

    async fn heartbeat_step(&self, step_id: Uuid) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let step = steps
            .get_mut(&step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;

        if step.status == StepStatus::InProgress {
            step.last_heartbeat = Some(Utc::now());
        }
        Ok(())
    }

    async fn append_log(&self, log: &NewStepLog) -> Result<(), StoreError> {
        self.logs.write().push(StepLog {
            id: Uuid::now_v7(),
            step_id: log.step_id,
            level: log.level.clone(),
            message: log.message.clone(),
            meta: log.meta.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn requeue_stale_steps(
        &self,
        heartbeat_ttl: Duration,
        limit: i64,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let threshold = now - chrono::Duration::from_std(heartbeat_ttl).unwrap_or_default();
        let mut steps = self.steps.write();

        let mut stale: Vec<Uuid> = steps
            .values()
            .filter(|s| {
                s.status == StepStatus::InProgress
                    && s.last_heartbeat.map(|hb| hb < threshold).unwrap_or(true)
            })
            .map(|s| s.id)
            .collect();
        stale.sort();
        stale.truncate(limit.max(0) as usize);

        let mut count = 0u64;
        for id in stale {
            let step = steps.get_mut(&id).expect("selected id present");
            step.attempts += 1;
            step.lock_owner = None;
            step.claimed_at = None;
            step.last_heartbeat = None;
            step.updated_at = now;

            if step.attempts >= step.max_attempts {
                step.status = StepStatus::Failed;
                step.error = Some("heartbeat expired".to_string());
                step.next_attempt_at = None;
            } else {
                step.status = StepStatus::Pending;
                step.next_attempt_at = Some(
                    now + chrono::Duration::from_std(retry_delay(step.attempts, heartbeat_ttl))
                        .unwrap_or_default(),
                );
            }
            count += 1;
        }

        Ok(count)
    }

    async fn enqueue_event(&self, event: &NewOutboxEvent) -> Result<(), StoreError> {
        let mut events = self.events.write();
        Self::insert_event_locked(&mut events, event);
        Ok(())
    }

    async fn claim_pending_events(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut events = self.events.write();

        let mut pending: Vec<(chrono::DateTime<Utc>, Uuid)> = events
            .values()
            .filter(|e| e.state == OutboxState::Pending)
            .map(|e| (e.created_at, e.id))
            .collect();
        pending.sort();
        pending.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(pending.len());
        for (_, id) in pending {
            let event = events.get_mut(&id).expect("selected id present");
            event.state = OutboxState::InFlight;
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn mark_event_published(&self, id: Uuid) -> Result<(), StoreError> {
        let mut events = self.events.write();
        let event = events.get_mut(&id).ok_or(StoreError::EventNotFound(id))?;
        event.state = OutboxState::Published;
        event.published = true;
        Ok(())
    }

    async fn mark_event_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut events = self.events.write();
        let event = events.get_mut(&id).ok_or(StoreError::EventNotFound(id))?;
        event.state = OutboxState::Failed;
        event.last_error = Some(error.to_string());
        Ok(())
    }
}
