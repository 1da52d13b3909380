//! Step executor with tagged dispatch
//!
//! Handlers are registered by step name at engine construction and looked up
//! per claimed step. Handlers carry no state beyond their captured
//! collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::persistence::{NewOutboxEvent, WorkflowStep};

/// Classified handler failure
///
/// The retry policy hangs off this split: transient failures consume one
/// attempt and are rescheduled with backoff; permanent failures terminate
/// the step immediately.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// I/O timeout, dependency unavailable; retried with backoff
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed input, contract violation; fails without requeue
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Successful handler output
///
/// Handlers never perform outbound side effects directly: they return the
/// outbox events to enqueue, and the scheduler commits them atomically with
/// the step's completion.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Opaque result blob persisted on the step
    pub output: serde_json::Value,

    /// Side effects to enqueue with the completion
    pub events: Vec<NewOutboxEvent>,
}

impl StepResult {
    /// A result with output and no side effects
    pub fn output(output: serde_json::Value) -> Self {
        Self {
            output,
            events: vec![],
        }
    }

    /// An empty result
    pub fn empty() -> Self {
        Self::output(serde_json::Value::Null)
    }

    /// Attach an outbox event
    pub fn with_event(mut self, event: NewOutboxEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Step handler function type
pub type StepHandler = Arc<
    dyn Fn(
            WorkflowStep,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<StepResult, StepError>> + Send>,
        > + Send
        + Sync,
>;

/// Dispatch table from step name to handler
///
/// # Example
///
/// ```ignore
/// let mut executor = StepExecutor::new();
/// executor.register("fetch_ticket", move |step| {
///     let source = Arc::clone(&source);
///     async move {
///         let data = source.fetch(&step.input).await
///             .map_err(|e| StepError::transient(e.to_string()))?;
///         Ok(StepResult::output(data))
///     }
/// });
/// ```
pub struct StepExecutor {
    handlers: HashMap<String, StepHandler>,
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl StepExecutor {
    /// Create an empty executor
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a step name
    pub fn register<F, Fut>(&mut self, step_name: &str, handler: F)
    where
        F: Fn(WorkflowStep) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StepResult, StepError>> + Send + 'static,
    {
        let handler: StepHandler = Arc::new(move |step| Box::pin(handler(step)));
        self.handlers.insert(step_name.to_string(), handler);
    }

    /// Register a prebuilt handler (see [`handlers`](crate::engine::handlers))
    pub fn register_handler(&mut self, step_name: &str, handler: StepHandler) {
        self.handlers.insert(step_name.to_string(), handler);
    }

    /// Check whether a handler is registered for a step name
    pub fn contains(&self, step_name: &str) -> bool {
        self.handlers.contains_key(step_name)
    }

    /// Get all registered step names
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }

    /// Execute a claimed step
    ///
    /// An unknown step name succeeds with an empty result so workflows can
    /// evolve ahead of their handlers; the scheduler records the execution
    /// in the step's diagnostic log.
    pub async fn execute(&self, step: WorkflowStep) -> Result<StepResult, StepError> {
        let Some(handler) = self.handlers.get(&step.step_name) else {
            warn!(
                step_id = %step.id,
                step_name = %step.step_name,
                "no handler registered, completing with empty result"
            );
            return Ok(StepResult::empty());
        };

        handler(step).await
    }
}
