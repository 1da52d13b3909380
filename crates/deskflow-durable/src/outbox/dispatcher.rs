//! In-process pub/sub of outbox events
//!
//! The dispatcher is an observability hook, not a delivery mechanism:
//! subscribers get best-effort copies of outbox activity over bounded
//! channels, and a subscriber that cannot keep up loses events for itself
//! alone. Durability is the outbox's job.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::persistence::OutboxEvent;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-subscriber channel capacity
    pub buffer: usize,

    /// How long a dispatch waits on a full subscriber before dropping
    pub delivery_timeout: std::time::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            buffer: 100,
            delivery_timeout: std::time::Duration::from_millis(100),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }
}

/// In-process event dispatcher
///
/// The subscriber map sits behind a read/write lock: dispatches take the
/// read side, subscriptions the write side.
///
/// # Example
///
/// ```ignore
/// let dispatcher = EventDispatcher::new(DispatcherConfig::default());
/// let mut rx = dispatcher.subscribe("email_send");
///
/// // elsewhere
/// dispatcher.dispatch(&event).await;
///
/// while let Some(event) = rx.recv().await {
///     println!("published: {}", event.event_type);
/// }
/// ```
pub struct EventDispatcher {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<OutboxEvent>>>>,
    config: DispatcherConfig,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl EventDispatcher {
    /// Create a new dispatcher
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Subscribe to events of one type
    ///
    /// Returns a bounded receiver. Dropping the receiver ends the
    /// subscription; the sender is pruned on a later dispatch.
    pub fn subscribe(&self, event_type: &str) -> mpsc::Receiver<OutboxEvent> {
        let (tx, rx) = mpsc::channel(self.config.buffer);
        self.subscribers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(tx);

        debug!(event_type, "added subscriber");
        rx
    }

    /// Deliver an event to all subscribers of its type, best-effort
    ///
    /// A subscriber whose buffer stays full past the delivery timeout has
    /// this event dropped for it; other subscribers are unaffected.
    pub async fn dispatch(&self, event: &OutboxEvent) {
        let senders: Vec<mpsc::Sender<OutboxEvent>> = {
            let subscribers = self.subscribers.read();
            match subscribers.get(&event.event_type) {
                Some(senders) => senders.clone(),
                None => return,
            }
        };

        let mut saw_closed = false;
        for sender in &senders {
            match sender
                .send_timeout(event.clone(), self.config.delivery_timeout)
                .await
            {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(
                        event_type = %event.event_type,
                        event_id = %event.id,
                        "subscriber full, dropping event"
                    );
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    saw_closed = true;
                }
            }
        }

        if saw_closed {
            self.prune(&event.event_type);
        }
    }

    /// Number of live subscribers for an event type
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .get(event_type)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn prune(&self, event_type: &str) {
        let mut subscribers = self.subscribers.write();
        if let Some(senders) = subscribers.get_mut(event_type) {
            senders.retain(|s| !s.is_closed());
            if senders.is_empty() {
                subscribers.remove(event_type);
            }
        }
    }
}
