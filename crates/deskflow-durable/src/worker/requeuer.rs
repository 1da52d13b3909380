//! Stale-step requeuer
//!
//! Recovery mechanism for worker crashes: when a worker dies mid-step its
//! claim stops heartbeating, and on the next sweep the row is atomically
//! returned to pending (or failed terminally if its attempt budget is
//! spent).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::persistence::WorkflowStore;

/// Requeuer configuration
///
/// The TTL must exceed the worst-case handler latency between heartbeats;
/// the default is three heartbeat intervals.
#[derive(Debug, Clone)]
pub struct RequeuerConfig {
    /// Sweep interval
    pub interval: Duration,

    /// Age after which an unheartbeated claim is considered dead
    pub heartbeat_ttl: Duration,

    /// Maximum steps reclaimed per sweep
    pub batch_size: i64,
}

impl Default for RequeuerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(90),
            batch_size: 100,
        }
    }
}

impl RequeuerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Background sweeper that revives claimed-but-dead steps
pub struct StaleStepRequeuer {
    store: Arc<dyn WorkflowStore>,
    config: RequeuerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StaleStepRequeuer {
    /// Create a new requeuer
    pub fn new(store: Arc<dyn WorkflowStore>, config: RequeuerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            config,
            shutdown_tx,
            shutdown_rx,
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Start the sweep loop
    #[instrument(skip(self))]
    pub fn start(&self) {
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store
                            .requeue_stale_steps(config.heartbeat_ttl, config.batch_size)
                            .await
                        {
                            Ok(count) if count > 0 => {
                                info!(count, "Requeued stale steps");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!("Stale step requeue failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Requeue loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Requeue loop exited");
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stop the sweep loop at the next cycle boundary
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
