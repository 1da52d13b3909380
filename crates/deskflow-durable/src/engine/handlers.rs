//! Built-in step handlers and collaborator contracts
//!
//! The engine ships handlers for the common step families of
//! customer-service-response workflows: fetching external data, querying a
//! retrieval service, drafting with an LLM, and sending mail. The
//! collaborators they call are opaque to the engine and injected at
//! construction.
//!
//! Send-family handlers perform no I/O. They validate their input and return
//! an outbox event; delivery happens in the outbox publisher, after the
//! event has been durably committed alongside the step's completion.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::executor::{StepError, StepHandler, StepResult};
use crate::persistence::{NewOutboxEvent, WorkflowStep};

/// Outbox event type produced by the send_email handler
pub const EMAIL_SEND_EVENT: &str = "email_send";

/// External data source (tickets, CRM records, ...)
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, input: &serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// LLM invocation function
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, input: &serde_json::Value) -> anyhow::Result<String>;
}

/// RAG query service
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> anyhow::Result<serde_json::Value>;
}

/// Email/notification adapter, called by the outbox publisher
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        message: &EmailMessage,
        idempotency_key: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Payload of an `email_send` outbox event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// Stable idempotency key for a step's logical effect
///
/// Caller-provided keys win; otherwise the key is derived from the run and
/// step ids. The attempt count is deliberately excluded so a retried step
/// maps to the same external effect.
pub fn effect_key(step: &WorkflowStep) -> String {
    step.idempotency_key
        .clone()
        .unwrap_or_else(|| format!("{}:{}", step.run_id, step.id))
}

/// Handler that pulls external data through a [`DataSource`]
pub fn fetch(source: Arc<dyn DataSource>) -> StepHandler {
    Arc::new(move |step| {
        let source = Arc::clone(&source);
        Box::pin(async move {
            let data = source
                .fetch(&step.input)
                .await
                .map_err(|e| StepError::transient(e.to_string()))?;
            Ok(StepResult::output(data))
        })
    })
}

/// Handler that queries a RAG service for context
///
/// When no retriever is configured the handler returns a neutral no-context
/// marker instead of failing, so workflows run unchanged on hosts without
/// retrieval.
pub fn retrieve_context(retriever: Option<Arc<dyn ContextRetriever>>) -> StepHandler {
    Arc::new(move |step| {
        let retriever = retriever.clone();
        Box::pin(async move {
            let Some(retriever) = retriever else {
                return Ok(StepResult::output(serde_json::json!({
                    "context": null,
                    "documents": [],
                })));
            };

            let query = step
                .input
                .get("query")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let response = retriever
                .retrieve(&query)
                .await
                .map_err(|e| StepError::transient(e.to_string()))?;
            Ok(StepResult::output(response))
        })
    })
}

/// Handler that drafts text with an [`LlmClient`]
pub fn draft(llm: Arc<dyn LlmClient>) -> StepHandler {
    Arc::new(move |step| {
        let llm = Arc::clone(&llm);
        Box::pin(async move {
            let text = llm
                .complete(&step.input)
                .await
                .map_err(|e| StepError::transient(e.to_string()))?;
            Ok(StepResult::output(serde_json::json!({ "draft": text })))
        })
    })
}

/// Handler that enqueues an email for outbox delivery
///
/// Input must deserialize to [`EmailMessage`]; anything else is a permanent
/// failure.
pub fn send_email() -> StepHandler {
    Arc::new(move |step| {
        Box::pin(async move {
            let message: EmailMessage = serde_json::from_value(step.input.clone())
                .map_err(|e| StepError::permanent(format!("invalid email input: {e}")))?;

            let key = effect_key(&step);
            let event = NewOutboxEvent::new(
                EMAIL_SEND_EVENT,
                serde_json::to_value(&message)
                    .map_err(|e| StepError::permanent(e.to_string()))?,
            )
            .with_idempotency_key(key);

            Ok(StepResult::output(serde_json::json!({ "queued": true })).with_event(event))
        })
    })
}
