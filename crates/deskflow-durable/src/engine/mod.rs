//! Step execution: dispatch table, error taxonomy, built-in handlers, and
//! the run entry point

mod executor;
pub mod handlers;

pub use executor::{StepError, StepExecutor, StepHandler, StepResult};
pub use handlers::{ContextRetriever, DataSource, EmailMessage, LlmClient, Mailer};

use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::persistence::{NewRun, StoreError, WorkflowStore};
use crate::workflow::Workflow;

/// Create a run and enqueue its initial plan
///
/// This is the entry point for external callers: the run row and the first
/// step batch are inserted, and the scheduler picks the work up from there.
#[instrument(skip(store, workflow, payload), fields(workflow_type = %workflow.id()))]
pub async fn start_run(
    store: &dyn WorkflowStore,
    workflow: &dyn Workflow,
    payload: Value,
) -> Result<Uuid, StoreError> {
    let run_id = Uuid::now_v7();

    store
        .create_run(&NewRun {
            id: run_id,
            workflow_type: workflow.id().to_string(),
            workflow_version: workflow.version().to_string(),
            payload,
        })
        .await?;

    let run = store
        .load_run(run_id)
        .await?
        .ok_or(StoreError::RunNotFound(run_id))?;

    let initial: Vec<_> = workflow
        .plan(&run, &[])
        .into_iter()
        .map(|def| def.into_new_step(run_id))
        .collect();

    if !initial.is_empty() {
        store.insert_steps(&initial).await?;
    }

    debug!(%run_id, steps = initial.len(), "started run");
    Ok(run_id)
}
