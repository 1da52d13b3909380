//! Outbox delivery and in-process event dispatch

mod dispatcher;
mod publisher;

pub use dispatcher::{DispatcherConfig, EventDispatcher};
pub use publisher::{email_adapter, EffectAdapter, OutboxPublisher, PublisherConfig};
