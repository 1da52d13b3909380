//! Workflow registry
//!
//! Maps workflow type names to their planner so the scheduler can expand
//! successors for any run it picks up. Registration is process-local and
//! happens at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::Workflow;

/// Registry of workflows keyed by their type id
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }

    /// Register a workflow. Idempotent by id: a second registration for the
    /// same id replaces the first.
    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        let id = workflow.id().to_string();
        if self.workflows.insert(id.clone(), workflow).is_some() {
            debug!(workflow_type = %id, "replaced registered workflow");
        }
    }

    /// Look up a workflow by type id
    pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(workflow_type).cloned()
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::persistence::{WorkflowRun, WorkflowStep};
    use crate::workflow::WorkflowStepDef;

    struct OneShotWorkflow;

    impl Workflow for OneShotWorkflow {
        fn id(&self) -> &str {
            "one_shot"
        }

        fn version(&self) -> &str {
            "1"
        }

        fn plan(&self, run: &WorkflowRun, steps: &[WorkflowStep]) -> Vec<WorkflowStepDef> {
            if steps.is_empty() {
                vec![WorkflowStepDef::new("do_it", 0, run.payload.clone())]
            } else {
                vec![]
            }
        }
    }

    fn sample_run() -> WorkflowRun {
        WorkflowRun {
            id: uuid::Uuid::now_v7(),
            workflow_type: "one_shot".to_string(),
            workflow_version: "1".to_string(),
            status: crate::persistence::RunStatus::Pending,
            payload: json!({"k": "v"}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(OneShotWorkflow));

        assert!(registry.contains("one_shot"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let workflow = registry.get("one_shot").expect("registered");
        assert_eq!(workflow.version(), "1");
    }

    #[test]
    fn test_register_is_idempotent_by_id() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(OneShotWorkflow));
        registry.register(Arc::new(OneShotWorkflow));

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_workflow_type() {
        let registry = WorkflowRegistry::new();
        assert!(registry.get("unknown").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(OneShotWorkflow));

        let workflow = registry.get("one_shot").unwrap();
        let run = sample_run();

        let first = workflow.plan(&run, &[]);
        let second = workflow.plan(&run, &[]);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].step_name, "do_it");
        assert_eq!(first[0].input, json!({"k": "v"}));
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(OneShotWorkflow));

        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("one_shot"));
    }

    #[test]
    fn test_workflow_types_iterator() {
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(OneShotWorkflow));

        let types: Vec<_> = registry.workflow_types().collect();
        assert_eq!(types, vec!["one_shot"]);
    }
}
