//! Scheduler and worker pool
//!
//! A single polling loop claims steps from the store and hands them to a
//! bounded pool of worker tasks. Each worker heartbeats its claim, runs the
//! handler under a hard timeout, and writes the terminal status. Worker
//! tasks are never cancelled by shutdown; the scheduler stops polling and
//! waits for them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backoff::retry_delay;
use crate::engine::{StepError, StepExecutor, StepResult};
use crate::persistence::{
    NewStepLog, RunStatus, StepCompletion, StepStatus, StoreError, WorkflowStep, WorkflowStore,
};
use crate::workflow::WorkflowRegistry;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identifier written as lock_owner on claimed steps
    pub worker_id: String,

    /// Maximum concurrent step executions
    pub worker_count: usize,

    /// Claim probe interval
    pub poll_interval: Duration,

    /// Claim heartbeat interval
    pub heartbeat_interval: Duration,

    /// Hard ceiling on a single handler execution
    pub step_hard_timeout: Duration,

    /// Heartbeat TTL; also the base of the retry backoff
    pub heartbeat_ttl: Duration,

    /// Graceful shutdown deadline for in-flight workers
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            worker_count: 4,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            step_hard_timeout: Duration::from_secs(300),
            heartbeat_ttl: Duration::from_secs(90),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_step_hard_timeout(mut self, timeout: Duration) -> Self {
        self.step_hard_timeout = timeout;
        self
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler already running
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// In-flight workers did not finish before the shutdown deadline
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Scheduler driving the claim/execute/complete cycle
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::new(store, executor, registry, SchedulerConfig::default());
/// scheduler.start()?;
///
/// // ... later
/// scheduler.shutdown().await?;
/// ```
pub struct Scheduler {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<StepExecutor>,
    registry: Arc<WorkflowRegistry>,
    config: SchedulerConfig,
    slots: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: Arc<StepExecutor>,
        registry: Arc<WorkflowRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            executor,
            registry,
            slots: Arc::new(Semaphore::new(config.worker_count)),
            config,
            shutdown_tx,
            shutdown_rx,
            poll_handle: std::sync::Mutex::new(None),
        }
    }

    /// Start the polling loop
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut handle_slot = self.poll_handle.lock().unwrap();
        if handle_slot.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!(
            worker_id = %self.config.worker_id,
            worker_count = self.config.worker_count,
            "Starting scheduler"
        );

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let registry = Arc::clone(&self.registry);
        let slots = Arc::clone(&self.slots);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.claim_next_step(&config.worker_id).await {
                            Ok(Some(step)) => {
                                // The claim is already owned, so waiting for a
                                // free slot while holding it is safe
                                let permit = match Arc::clone(&slots).acquire_owned().await {
                                    Ok(p) => p,
                                    Err(_) => break,
                                };

                                let store = Arc::clone(&store);
                                let executor = Arc::clone(&executor);
                                let registry = Arc::clone(&registry);
                                let config = config.clone();

                                tokio::spawn(async move {
                                    run_step(store, executor, registry, config, step).await;
                                    drop(permit);
                                });
                            }
                            Ok(None) => {}
                            Err(e) => {
                                // Abort this tick; the next one retries
                                error!("Claim failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Poll loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Poll loop exited");
        });

        *handle_slot = Some(handle);
        Ok(())
    }

    /// Stop polling and wait for in-flight workers
    ///
    /// Already-claimed steps always reach a terminal or rescheduled state:
    /// worker tasks are not cancelled, only awaited up to the shutdown
    /// deadline.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        // Join the poll loop rather than aborting it: a claim made just
        // before the signal still gets handed to a worker
        let poll_handle = self.poll_handle.lock().unwrap().take();
        if let Some(handle) = poll_handle {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.slots.available_permits();
            if available == self.config.worker_count {
                debug!("All workers completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.config.worker_count - available,
                    "Shutdown timeout reached"
                );
                return Err(SchedulerError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(worker_id = %self.config.worker_id, "Scheduler stopped");
        Ok(())
    }

    /// Number of steps currently executing
    pub fn current_load(&self) -> usize {
        self.config.worker_count - self.slots.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }
}

/// Execute one claimed step to a terminal or rescheduled state
async fn run_step(
    store: Arc<dyn WorkflowStore>,
    executor: Arc<StepExecutor>,
    registry: Arc<WorkflowRegistry>,
    config: SchedulerConfig,
    step: WorkflowStep,
) {
    mark_run_running(store.as_ref(), step.run_id).await;

    if !executor.contains(&step.step_name) {
        let log = NewStepLog::warn(
            step.id,
            "no handler registered for step",
            serde_json::json!({ "step_name": step.step_name }),
        );
        if let Err(e) = store.append_log(&log).await {
            warn!(step_id = %step.id, "Failed to append log: {}", e);
        }
    }

    // Heartbeat until the handler returns; joined before any terminal write
    // so a late heartbeat can never trail the terminal status
    let (hb_stop_tx, hb_stop_rx) = watch::channel(false);
    let hb_handle = tokio::spawn(heartbeat_loop(
        Arc::clone(&store),
        step.id,
        config.heartbeat_interval,
        hb_stop_rx,
    ));

    let outcome =
        match tokio::time::timeout(config.step_hard_timeout, executor.execute(step.clone())).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(StepError::transient(format!(
                "step timed out after {:?}",
                config.step_hard_timeout
            ))),
        };

    let _ = hb_stop_tx.send(true);
    let _ = hb_handle.await;

    match outcome {
        Ok(result) => complete_step(store, registry, step, result).await,
        Err(err) => fail_step(store, &config, step, err).await,
    }
}

async fn heartbeat_loop(
    store: Arc<dyn WorkflowStore>,
    step_id: Uuid,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // immediate first tick; the claim already stamped a heartbeat

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.heartbeat_step(step_id).await {
                    warn!(%step_id, "Heartbeat failed: {}", e);
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
}

/// Commit a successful step: plan successors, then write the completion,
/// successor inserts, and outbox events in one store transaction
async fn complete_step(
    store: Arc<dyn WorkflowStore>,
    registry: Arc<WorkflowRegistry>,
    step: WorkflowStep,
    result: StepResult,
) {
    let successors = match plan_successors(store.as_ref(), &registry, &step, &result).await {
        Ok(successors) => successors,
        Err(e) => {
            error!(step_id = %step.id, "Failed to plan successors: {}", e);
            vec![]
        }
    };

    let completion = StepCompletion::new(step.id, result.output)
        .with_events(result.events)
        .with_successors(successors);

    if let Err(e) = terminal_write(|| store.complete_step(completion.clone())).await {
        error!(step_id = %step.id, "Failed to persist completion: {}", e);
        return;
    }

    debug!(step_id = %step.id, step_name = %step.step_name, "step completed");
    finalize_run(store.as_ref(), step.run_id).await;
}

/// Invoke the run's workflow plan against the post-completion step set
async fn plan_successors(
    store: &dyn WorkflowStore,
    registry: &WorkflowRegistry,
    step: &WorkflowStep,
    result: &StepResult,
) -> Result<Vec<crate::persistence::NewStep>, StoreError> {
    let Some(run) = store.load_run(step.run_id).await? else {
        return Ok(vec![]);
    };

    let Some(workflow) = registry.get(&run.workflow_type) else {
        debug!(workflow_type = %run.workflow_type, "no workflow registered, skipping plan");
        return Ok(vec![]);
    };

    // Present the plan with the state the transaction is about to commit
    let mut steps = store.load_steps(step.run_id).await?;
    if let Some(current) = steps.iter_mut().find(|s| s.id == step.id) {
        current.status = StepStatus::Completed;
        current.result = Some(result.output.clone());
    }

    let successors = workflow
        .plan(&run, &steps)
        .into_iter()
        .filter(|def| {
            !steps
                .iter()
                .any(|s| s.seq == def.seq && s.step_name == def.step_name)
        })
        .map(|def| def.into_new_step(step.run_id))
        .collect();

    Ok(successors)
}

/// Record a failed execution: reschedule with backoff or fail terminally
async fn fail_step(
    store: Arc<dyn WorkflowStore>,
    config: &SchedulerConfig,
    mut step: WorkflowStep,
    err: StepError,
) {
    step.attempts += 1;
    step.error = Some(err.to_string());
    step.lock_owner = None;

    let exhausted = step.attempts >= step.max_attempts;
    if err.is_permanent() || exhausted {
        step.status = StepStatus::Failed;
        step.next_attempt_at = None;
    } else {
        step.status = StepStatus::Pending;
        let delay = retry_delay(step.attempts, config.heartbeat_ttl);
        step.next_attempt_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
    }

    let failed = step.status == StepStatus::Failed;
    warn!(
        step_id = %step.id,
        step_name = %step.step_name,
        attempts = step.attempts,
        terminal = failed,
        "step failed: {}",
        err
    );

    if let Err(e) = terminal_write(|| store.update_step(&step)).await {
        error!(step_id = %step.id, "Failed to persist failure: {}", e);
        return;
    }

    if failed {
        if let Err(e) = store.update_run_status(step.run_id, RunStatus::Failed).await {
            error!(run_id = %step.run_id, "Failed to fail run: {}", e);
        }
    }
}

async fn mark_run_running(store: &dyn WorkflowStore, run_id: Uuid) {
    match store.load_run(run_id).await {
        Ok(Some(run)) if run.status == RunStatus::Pending => {
            if let Err(e) = store.update_run_status(run_id, RunStatus::Running).await {
                warn!(%run_id, "Failed to mark run running: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => warn!(%run_id, "Failed to load run: {}", e),
    }
}

/// Mark the run completed once every step is terminal and none failed
async fn finalize_run(store: &dyn WorkflowStore, run_id: Uuid) {
    let steps = match store.load_steps(run_id).await {
        Ok(steps) => steps,
        Err(e) => {
            warn!(%run_id, "Failed to load steps: {}", e);
            return;
        }
    };

    if steps.iter().all(|s| s.status == StepStatus::Completed) {
        if let Err(e) = store.update_run_status(run_id, RunStatus::Completed).await {
            warn!(%run_id, "Failed to complete run: {}", e);
        } else {
            info!(%run_id, "run completed");
        }
    }
}

/// Terminal updates survive host cancellation: the surrounding task is never
/// aborted, and transient store errors get a short bounded retry
async fn terminal_write<F, Fut>(mut write: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    const ATTEMPTS: u32 = 3;

    let mut last_err = None;
    for attempt in 1..=ATTEMPTS {
        match write().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt < ATTEMPTS {
                    warn!("Terminal write failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}
