//! Persistence layer: the store contract and its implementations

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PgWorkflowStore;
pub use store::{
    NewOutboxEvent, NewRun, NewStep, NewStepLog, OutboxEvent, OutboxState, RunStatus,
    StepCompletion, StepLog, StepStatus, StoreError, WorkflowRun, WorkflowStep, WorkflowStore,
};
