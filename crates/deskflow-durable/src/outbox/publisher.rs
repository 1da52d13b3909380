//! Outbox publisher
//!
//! Drains the outbox: batch-claims pending events, performs the matching
//! side effect, and marks each row published or failed. Combined with
//! adapter-side idempotency keys this yields effectively-once external
//! effects on top of at-least-once delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::EventDispatcher;
use crate::engine::handlers::{EmailMessage, Mailer};
use crate::persistence::{OutboxEvent, WorkflowStore};

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Drain cycle interval
    pub interval: Duration,

    /// Maximum events claimed per cycle
    pub batch_size: i64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

impl PublisherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Side-effect adapter function type, keyed by event_type
pub type EffectAdapter = Arc<
    dyn Fn(
            OutboxEvent,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Adapter for `email_send` events backed by a [`Mailer`]
///
/// The event's idempotency key is forwarded so the mail channel can
/// deduplicate replays.
pub fn email_adapter(mailer: Arc<dyn Mailer>) -> EffectAdapter {
    Arc::new(move |event| {
        let mailer = Arc::clone(&mailer);
        Box::pin(async move {
            let message: EmailMessage = serde_json::from_value(event.payload.clone())
                .map_err(|e| anyhow::anyhow!("invalid email payload: {e}"))?;
            mailer
                .send(&message, event.idempotency_key.as_deref())
                .await
        })
    })
}

/// Batch processor draining pending outbox events
///
/// # Example
///
/// ```ignore
/// let mut publisher = OutboxPublisher::new(store, dispatcher, PublisherConfig::default());
/// publisher.register("email_send", email_adapter(mailer));
/// publisher.start();
///
/// // ... later
/// publisher.shutdown().await;
/// ```
pub struct OutboxPublisher {
    store: Arc<dyn WorkflowStore>,
    dispatcher: Arc<EventDispatcher>,
    adapters: HashMap<String, EffectAdapter>,
    config: PublisherConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OutboxPublisher {
    /// Create a new publisher
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        dispatcher: Arc<EventDispatcher>,
        config: PublisherConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            dispatcher,
            adapters: HashMap::new(),
            config,
            shutdown_tx,
            shutdown_rx,
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Register a side-effect adapter for an event type
    pub fn register(&mut self, event_type: &str, adapter: EffectAdapter) {
        self.adapters.insert(event_type.to_string(), adapter);
    }

    /// Check whether an adapter is registered for an event type
    pub fn contains(&self, event_type: &str) -> bool {
        self.adapters.contains_key(event_type)
    }

    /// Start the drain loop
    #[instrument(skip(self))]
    pub fn start(&self) {
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let adapters = self.adapters.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            adapters = ?adapters.keys().collect::<Vec<_>>(),
            "Starting outbox publisher"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_cycle(&store, &dispatcher, &adapters, config.batch_size).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Publisher loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Publisher loop exited");
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stop the drain loop at the next cycle boundary
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// One drain cycle: claim a batch, deliver each event, mark the outcome
async fn run_cycle(
    store: &Arc<dyn WorkflowStore>,
    dispatcher: &Arc<EventDispatcher>,
    adapters: &HashMap<String, EffectAdapter>,
    batch_size: i64,
) {
    let events = match store.claim_pending_events(batch_size).await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to claim outbox events: {}", e);
            return;
        }
    };

    for event in events {
        let Some(adapter) = adapters.get(&event.event_type) else {
            // Marked published so the row cannot loop through the queue
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "no adapter for event type, marking published"
            );
            if let Err(e) = store.mark_event_published(event.id).await {
                error!(event_id = %event.id, "Failed to mark event published: {}", e);
            } else {
                dispatcher.dispatch(&event).await;
            }
            continue;
        };

        match adapter(event.clone()).await {
            Ok(()) => {
                if let Err(e) = store.mark_event_published(event.id).await {
                    error!(event_id = %event.id, "Failed to mark event published: {}", e);
                    continue;
                }
                debug!(event_id = %event.id, event_type = %event.event_type, "published event");
                dispatcher.dispatch(&event).await;
            }
            Err(delivery_err) => {
                // Failed events wait for operator inspection; no retry here
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "delivery failed: {}",
                    delivery_err
                );
                if let Err(e) = store
                    .mark_event_failed(event.id, &delivery_err.to_string())
                    .await
                {
                    error!(event_id = %event.id, "Failed to mark event failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::persistence::{InMemoryWorkflowStore, NewOutboxEvent, OutboxState};

    /// Mailer that records every send
    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(EmailMessage, Option<String>)>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(
            &self,
            message: &EmailMessage,
            idempotency_key: Option<&str>,
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .push((message.clone(), idempotency_key.map(String::from)));
            Ok(())
        }
    }

    struct FailingMailer;

    #[async_trait]
    impl Mailer for FailingMailer {
        async fn send(&self, _: &EmailMessage, _: Option<&str>) -> anyhow::Result<()> {
            anyhow::bail!("smtp unreachable")
        }
    }

    fn email_event() -> NewOutboxEvent {
        NewOutboxEvent::new(
            "email_send",
            json!({"to": "a@b", "subject": "x", "body": "y"}),
        )
        .with_idempotency_key("E-1")
    }

    #[tokio::test]
    async fn test_publishes_and_dispatches() {
        let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
        let dispatcher = Arc::new(EventDispatcher::default());
        let mailer = Arc::new(RecordingMailer::default());

        store.enqueue_event(&email_event()).await.unwrap();

        let mut adapters = HashMap::new();
        adapters.insert(
            "email_send".to_string(),
            email_adapter(Arc::clone(&mailer) as Arc<dyn Mailer>),
        );

        let mut rx = dispatcher.subscribe("email_send");
        run_cycle(&store, &dispatcher, &adapters, 100).await;

        let sent = mailer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.to, "a@b");
        assert_eq!(sent[0].1.as_deref(), Some("E-1"));
        drop(sent);

        let notified = rx.recv().await.unwrap();
        assert_eq!(notified.event_type, "email_send");
    }

    #[tokio::test]
    async fn test_delivery_failure_marks_failed() {
        let memory = Arc::new(InMemoryWorkflowStore::new());
        let store: Arc<dyn WorkflowStore> = Arc::clone(&memory) as _;
        let dispatcher = Arc::new(EventDispatcher::default());

        store.enqueue_event(&email_event()).await.unwrap();

        let mut adapters = HashMap::new();
        adapters.insert(
            "email_send".to_string(),
            email_adapter(Arc::new(FailingMailer) as Arc<dyn Mailer>),
        );

        run_cycle(&store, &dispatcher, &adapters, 100).await;

        assert_eq!(memory.event_count(OutboxState::Failed), 1);
        assert_eq!(memory.event_count(OutboxState::Published), 0);

        // Failed events are not silently retried by the next cycle
        run_cycle(&store, &dispatcher, &adapters, 100).await;
        assert_eq!(memory.event_count(OutboxState::Failed), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_type_marked_published() {
        let memory = Arc::new(InMemoryWorkflowStore::new());
        let store: Arc<dyn WorkflowStore> = Arc::clone(&memory) as _;
        let dispatcher = Arc::new(EventDispatcher::default());

        store
            .enqueue_event(&NewOutboxEvent::new("mystery", json!({})))
            .await
            .unwrap();

        run_cycle(&store, &dispatcher, &HashMap::new(), 100).await;

        assert_eq!(memory.event_count(OutboxState::Published), 1);
    }

    #[tokio::test]
    async fn test_idempotent_enqueue_delivers_once() {
        let memory = Arc::new(InMemoryWorkflowStore::new());
        let store: Arc<dyn WorkflowStore> = Arc::clone(&memory) as _;
        let dispatcher = Arc::new(EventDispatcher::default());
        let mailer = Arc::new(RecordingMailer::default());

        // Two enqueues with the same key, as a retried step would produce
        store.enqueue_event(&email_event()).await.unwrap();
        store.enqueue_event(&email_event()).await.unwrap();

        let mut adapters = HashMap::new();
        adapters.insert(
            "email_send".to_string(),
            email_adapter(Arc::clone(&mailer) as Arc<dyn Mailer>),
        );

        run_cycle(&store, &dispatcher, &adapters, 100).await;

        assert_eq!(mailer.sent.lock().len(), 1);
        assert_eq!(memory.event_count(OutboxState::Published), 1);
    }

    #[tokio::test]
    async fn test_background_loop_start_and_shutdown() {
        let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
        let dispatcher = Arc::new(EventDispatcher::default());
        let mailer = Arc::new(RecordingMailer::default());

        store.enqueue_event(&email_event()).await.unwrap();

        let mut publisher = OutboxPublisher::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            PublisherConfig::new().with_interval(Duration::from_millis(10)),
        );
        publisher.register(
            "email_send",
            email_adapter(Arc::clone(&mailer) as Arc<dyn Mailer>),
        );
        publisher.start();

        for _ in 0..100 {
            if !mailer.sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mailer.sent.lock().len(), 1);

        publisher.shutdown().await;
    }
}
