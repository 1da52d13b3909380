//! Customer-service-response workflow
//!
//! fetch_ticket -> retrieve_context -> draft_response -> send_response,
//! each successor enqueued as its predecessor completes. The plan is a pure
//! function of the run payload and the step set, so replays expand
//! identically.

use serde_json::json;

use deskflow_durable::persistence::{StepStatus, WorkflowRun, WorkflowStep};
use deskflow_durable::workflow::{Workflow, WorkflowStepDef};

pub struct CsrWorkflow;

impl CsrWorkflow {
    fn completed<'a>(steps: &'a [WorkflowStep], name: &str) -> Option<&'a WorkflowStep> {
        steps
            .iter()
            .find(|s| s.step_name == name && s.status == StepStatus::Completed)
    }
}

impl Workflow for CsrWorkflow {
    fn id(&self) -> &str {
        "csr"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn plan(&self, run: &WorkflowRun, steps: &[WorkflowStep]) -> Vec<WorkflowStepDef> {
        if steps.is_empty() {
            return vec![WorkflowStepDef::new("fetch_ticket", 0, run.payload.clone())];
        }

        let fetched = Self::completed(steps, "fetch_ticket");
        let retrieved = Self::completed(steps, "retrieve_context");
        let drafted = Self::completed(steps, "draft_response");
        let sent = Self::completed(steps, "send_response");

        if let Some(fetched) = fetched {
            if retrieved.is_none() {
                let subject = fetched
                    .result
                    .as_ref()
                    .and_then(|r| r.pointer("/ticket/subject"))
                    .cloned()
                    .unwrap_or(json!(""));
                return vec![WorkflowStepDef::new(
                    "retrieve_context",
                    1,
                    json!({ "query": subject }),
                )];
            }
        }

        if let (Some(fetched), Some(retrieved)) = (fetched, retrieved) {
            if drafted.is_none() {
                return vec![WorkflowStepDef::new(
                    "draft_response",
                    2,
                    json!({
                        "ticket": fetched.result.clone().unwrap_or(json!(null)),
                        "context": retrieved.result.clone().unwrap_or(json!(null)),
                    }),
                )];
            }
        }

        if let (Some(fetched), Some(drafted)) = (fetched, drafted) {
            if sent.is_none() {
                let to = fetched
                    .result
                    .as_ref()
                    .and_then(|r| r.pointer("/ticket/requester"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let subject = fetched
                    .result
                    .as_ref()
                    .and_then(|r| r.pointer("/ticket/subject"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("your request");
                let body = drafted
                    .result
                    .as_ref()
                    .and_then(|r| r.get("draft"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                return vec![WorkflowStepDef::new(
                    "send_response",
                    3,
                    json!({
                        "to": to,
                        "subject": format!("Re: {subject}"),
                        "body": body,
                    }),
                )
                .with_idempotency_key(format!("csr-send-{}", run.id))];
            }
        }

        vec![]
    }
}
