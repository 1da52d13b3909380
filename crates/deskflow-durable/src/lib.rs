//! # Durable Workflow Engine
//!
//! A PostgreSQL-backed orchestration engine for reliable, multi-step workflow
//! execution across a pool of workers.
//!
//! ## Features
//!
//! - **Persistent runs and steps**: every state transition is committed before it
//!   is acted on, so a crashed worker never loses work
//! - **Transactional claiming**: `FOR UPDATE SKIP LOCKED` row claims guarantee a
//!   step is executed by at most one worker at a time
//! - **Automatic retries**: deterministic exponential backoff up to a per-step
//!   attempt budget
//! - **Stale-claim recovery**: heartbeats prove liveness; a background sweeper
//!   returns orphaned claims to the queue
//! - **Transactional outbox**: side effects (email, notifications) are enqueued
//!   in the same transaction as step completion and delivered at-least-once by a
//!   separate publisher
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (claims steps, runs handlers, heartbeats, plans successors)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (PostgreSQL: workflow_runs, workflow_steps, outbox_events) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     OutboxPublisher                          │
//! │  (claims pending events, performs side effects, dispatches) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use deskflow_durable::prelude::*;
//!
//! let store: Arc<dyn WorkflowStore> = Arc::new(PgWorkflowStore::new(pool));
//!
//! let mut registry = WorkflowRegistry::new();
//! registry.register(Arc::new(MyWorkflow));
//!
//! let mut executor = StepExecutor::new();
//! executor.register("fetch_ticket", handlers::fetch(source));
//!
//! let scheduler = Scheduler::new(store, Arc::new(executor), Arc::new(registry), config);
//! scheduler.start();
//! ```

pub mod backoff;
pub mod engine;
pub mod outbox;
pub mod persistence;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::backoff::retry_delay;
    pub use crate::engine::{
        handlers, start_run, ContextRetriever, DataSource, LlmClient, Mailer, StepError,
        StepExecutor, StepResult,
    };
    pub use crate::outbox::{
        DispatcherConfig, EventDispatcher, OutboxPublisher, PublisherConfig,
    };
    pub use crate::persistence::{
        InMemoryWorkflowStore, NewOutboxEvent, NewRun, NewStep, NewStepLog, OutboxEvent,
        OutboxState, PgWorkflowStore, RunStatus, StepCompletion, StepStatus, StoreError,
        WorkflowRun, WorkflowStep, WorkflowStore,
    };
    pub use crate::worker::{
        RequeuerConfig, Scheduler, SchedulerConfig, SchedulerError, StaleStepRequeuer,
    };
    pub use crate::workflow::{Workflow, WorkflowRegistry, WorkflowStepDef};
}

// Re-export key types at crate root
pub use engine::{StepError, StepExecutor, StepResult};
pub use outbox::{EventDispatcher, OutboxPublisher};
pub use persistence::{
    InMemoryWorkflowStore, PgWorkflowStore, RunStatus, StepStatus, StoreError, WorkflowStore,
};
pub use worker::{Scheduler, SchedulerConfig, StaleStepRequeuer};
pub use workflow::{Workflow, WorkflowRegistry, WorkflowStepDef};
