//! Workflow trait definition

use crate::persistence::{NewStep, WorkflowRun, WorkflowStep};

/// Definition of a step a workflow wants enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStepDef {
    /// Handler name used for dispatch
    pub step_name: String,

    /// Ordering hint within the run
    pub seq: i32,

    /// Opaque input blob for the handler
    pub input: serde_json::Value,

    /// Attempt budget
    pub max_attempts: i32,

    /// Stable token for the step's logical effect, carried across retries
    pub idempotency_key: Option<String>,
}

impl WorkflowStepDef {
    pub fn new(step_name: impl Into<String>, seq: i32, input: serde_json::Value) -> Self {
        Self {
            step_name: step_name.into(),
            seq,
            input,
            max_attempts: NewStep::DEFAULT_MAX_ATTEMPTS,
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

    /// Convert to an insertable step for the given run
    pub fn into_new_step(self, run_id: uuid::Uuid) -> NewStep {
        NewStep {
            run_id,
            step_name: self.step_name,
            seq: self.seq,
            input: self.input,
            max_attempts: self.max_attempts,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// A workflow is a deterministic planner over run state
///
/// `plan` is invoked with the run and its current steps. When a run is
/// created the slice is empty; after a step completes the slice includes the
/// completed step with its result. It returns the next steps to enqueue.
///
/// # Determinism
///
/// `plan` must be a pure function of its arguments: no clocks, no I/O, no
/// randomness. Replay after a crash re-invokes `plan` with the same state and
/// must yield the same expansion; duplicate step tuples from a replayed plan
/// are ignored at insert time.
///
/// # Example
///
/// ```ignore
/// struct CsrWorkflow;
///
/// impl Workflow for CsrWorkflow {
///     fn id(&self) -> &str { "csr" }
///     fn version(&self) -> &str { "1" }
///
///     fn plan(&self, run: &WorkflowRun, steps: &[WorkflowStep]) -> Vec<WorkflowStepDef> {
///         if steps.is_empty() {
///             return vec![WorkflowStepDef::new("fetch_ticket", 0, run.payload.clone())];
///         }
///         // ... enqueue successors as predecessors complete
///         vec![]
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique workflow type identifier, matched against `run.workflow_type`
    fn id(&self) -> &str;

    /// Workflow version
    fn version(&self) -> &str;

    /// Produce the next step definitions for the run given its current steps
    fn plan(&self, run: &WorkflowRun, steps: &[WorkflowStep]) -> Vec<WorkflowStepDef>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_step_def_builder() {
        let def = WorkflowStepDef::new("send_response", 3, json!({"to": "a@b"}))
            .with_max_attempts(3)
            .with_idempotency_key("E-1");

        assert_eq!(def.step_name, "send_response");
        assert_eq!(def.seq, 3);
        assert_eq!(def.max_attempts, 3);
        assert_eq!(def.idempotency_key.as_deref(), Some("E-1"));
    }

    #[test]
    fn test_max_attempts_floor() {
        let def = WorkflowStepDef::new("x", 0, json!({})).with_max_attempts(0);
        assert_eq!(def.max_attempts, 1);
    }

    #[test]
    fn test_into_new_step() {
        let run_id = uuid::Uuid::now_v7();
        let step = WorkflowStepDef::new("fetch_ticket", 0, json!({"id": "T-7"}))
            .into_new_step(run_id);

        assert_eq!(step.run_id, run_id);
        assert_eq!(step.step_name, "fetch_ticket");
        assert_eq!(step.max_attempts, NewStep::DEFAULT_MAX_ATTEMPTS);
    }
}
