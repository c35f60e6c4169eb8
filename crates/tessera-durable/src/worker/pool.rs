//! Worker pool for activity execution
//!
//! One pool serves one task queue: it long-polls for leases, executes
//! registered activity handlers on a bounded set of slots, forwards
//! heartbeats (renewing the lease and observing cancellation), and reports
//! attempt outcomes back to the store. Workers never execute workflow code.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::poller::{PollerConfig, TaskPoller};
use crate::activity::{error_types, ActivityContext, ActivityError, ActivitySet};
use crate::persistence::{ClaimedTask, ExecutionStore, StoreError, WorkerInfo};
use crate::reliability::retry::duration_millis;
use crate::router::TaskQueue;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queue this pool serves
    pub queue: TaskQueue,

    /// Maximum concurrent task executions; defaults to the queue's cap.
    pub max_concurrency: usize,

    /// Backpressure configuration
    pub backpressure: BackpressureConfig,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Worker-registry heartbeat interval
    #[serde(with = "duration_millis")]
    pub registry_heartbeat_interval: Duration,

    /// Graceful drain timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl WorkerPoolConfig {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            worker_id: format!("{}-worker-{}", queue.as_str(), Uuid::now_v7()),
            queue,
            max_concurrency: queue.concurrency_cap(),
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            registry_heartbeat_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Pool created but not started
    Stopped,
    /// Pool is polling and executing
    Running,
    /// Pool is draining: in-flight tasks finish, no new claims
    Draining,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Drain timeout
    #[error("graceful drain timed out")]
    DrainTimeout,
}

/// Worker pool executing activities from one queue.
///
/// # Example
///
/// ```ignore
/// let mut activities = ActivitySet::new();
/// activities.register(DownloadBlob::new(blob_store));
///
/// let pool = WorkerPool::new(store, WorkerPoolConfig::new(TaskQueue::Storage), activities);
/// pool.start().await?;
/// // ...
/// pool.drain().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn ExecutionStore>,
    config: WorkerPoolConfig,
    activities: Arc<ActivitySet>,
    backpressure: Arc<BackpressureState>,
    slots: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: parking_lot::RwLock<WorkerPoolStatus>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        config: WorkerPoolConfig,
        activities: ActivitySet,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));

        Self {
            store,
            slots: Arc::new(Semaphore::new(config.max_concurrency)),
            activities: Arc::new(activities),
            backpressure,
            shutdown_tx,
            shutdown_rx,
            status: parking_lot::RwLock::new(WorkerPoolStatus::Stopped),
            handles: parking_lot::Mutex::new(Vec::new()),
            config,
        }
    }

    /// Start polling and executing.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, queue = %self.config.queue))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read();
            if status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            queue = %self.config.queue,
            max_concurrency = self.config.max_concurrency,
            activity_types = ?self.activities.activity_types(),
            "starting worker pool"
        );

        self.register_worker().await?;
        *self.status.write() = WorkerPoolStatus::Running;

        let mut handles = self.handles.lock();
        handles.push(self.spawn_poll_loop());
        handles.push(self.spawn_registry_heartbeat_loop());

        Ok(())
    }

    /// Drain: stop claiming, finish in-flight work, deregister.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn drain(&self) -> Result<(), WorkerPoolError> {
        {
            let status = *self.status.read();
            if status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
        }

        info!(worker_id = %self.config.worker_id, "draining worker pool");
        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.slots.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.config.max_concurrency - self.slots.available_permits(),
                    "drain timeout reached"
                );
                return Err(WorkerPoolError::DrainTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.store
            .deregister_worker(&self.config.worker_id)
            .await?;
        *self.status.write() = WorkerPoolStatus::Stopped;

        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Liveness: the pool object is running its loops.
    pub fn is_live(&self) -> bool {
        *self.status.read() != WorkerPoolStatus::Stopped
    }

    /// Readiness: registered, polling, and accepting work.
    pub fn is_ready(&self) -> bool {
        *self.status.read() == WorkerPoolStatus::Running && self.backpressure.is_accepting()
    }

    pub fn current_load(&self) -> usize {
        self.backpressure.current_load()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    async fn register_worker(&self) -> Result<(), WorkerPoolError> {
        self.store
            .register_worker(WorkerInfo {
                id: self.config.worker_id.clone(),
                queue: self.config.queue,
                activity_types: self.activities.activity_types(),
                max_concurrency: self.config.max_concurrency as u32,
                current_load: 0,
                accepting_tasks: true,
                started_at: Utc::now(),
                last_heartbeat_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let activities = Arc::clone(&self.activities);
        let backpressure = Arc::clone(&self.backpressure);
        let slots = Arc::clone(&self.slots);
        let shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut poller = TaskPoller::new(
                Arc::clone(&store),
                config.queue,
                config.worker_id.clone(),
                activities.activity_types(),
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                if !backpressure.should_accept() {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                let available = backpressure.available_slots();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let permit = match Arc::clone(&slots).try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };

                            backpressure.task_started();

                            let store = Arc::clone(&store);
                            let activities = Arc::clone(&activities);
                            let bp = Arc::clone(&backpressure);
                            let worker_id = config.worker_id.clone();

                            tokio::spawn(async move {
                                execute_task(store, activities, worker_id, task).await;
                                bp.task_completed();
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("poll error: {e}");
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        })
    }

    fn spawn_registry_heartbeat_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.registry_heartbeat_interval;
        let backpressure = Arc::clone(&self.backpressure);
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let load = backpressure.current_load();
                        let accepting = backpressure.is_accepting();
                        if let Err(e) = store.worker_heartbeat(&worker_id, load, accepting).await {
                            error!("worker heartbeat failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("registry heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

/// Execute one claimed task end to end and report the outcome.
async fn execute_task(
    store: Arc<dyn ExecutionStore>,
    activities: Arc<ActivitySet>,
    worker_id: String,
    task: ClaimedTask,
) {
    let task_id = task.task_id;

    let Some(handler) = activities.get(&task.activity_type) else {
        warn!(%task_id, activity_type = %task.activity_type, "no handler registered");
        let error = ActivityError::non_retryable(format!(
            "no handler registered for activity type {}",
            task.activity_type
        ))
        .with_type(error_types::ACTIVITY_TYPE_NOT_REGISTERED);
        if let Err(e) = store.fail_task(task_id, &error).await {
            error!(%task_id, "failed to report unregistered activity: {e}");
        }
        return;
    };

    let start_to_close = task.options.start_to_close_timeout;
    let deadline = Utc::now() + chrono::Duration::from_std(start_to_close).unwrap_or_default();

    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(16);
    let ctx = ActivityContext::new(
        task.workflow_id.clone(),
        task.run_id,
        task.activity_id.clone(),
        task.attempt,
        task.options.retry_policy.max_attempts,
        deadline,
    )
    .with_heartbeat(heartbeat_tx);
    let cancellation = ctx.cancellation_handle();

    // Forward heartbeats: each renews the lease and surfaces a pending
    // cancellation request back into the activity context.
    let heartbeat_store = Arc::clone(&store);
    let heartbeat_handle = tokio::spawn({
        let cancellation = cancellation.clone();
        let worker_id = worker_id.clone();
        async move {
            while let Some(payload) = heartbeat_rx.recv().await {
                match heartbeat_store
                    .record_heartbeat(task_id, &worker_id, payload.details)
                    .await
                {
                    Ok(response) => {
                        if response.cancel_requested || !response.accepted {
                            cancellation.cancel();
                        }
                    }
                    Err(e) => {
                        error!(%task_id, "heartbeat report failed: {e}");
                    }
                }
            }
        }
    });

    debug!(
        %task_id,
        activity_id = %task.activity_id,
        activity_type = %task.activity_type,
        attempt = task.attempt,
        "executing activity"
    );

    let result = tokio::time::timeout(start_to_close, handler(ctx, task.input.clone())).await;
    heartbeat_handle.abort();

    let report = match result {
        Ok(Ok(output)) => store.complete_task(task_id, output).await.map(|_| ()),
        Ok(Err(error)) => store.fail_task(task_id, &error).await.map(|_| ()),
        Err(_elapsed) => {
            // Local deadline enforcement; the engine sweep is the backstop.
            let error = ActivityError::retryable(format!(
                "attempt exceeded start_to_close_timeout ({start_to_close:?})"
            ))
            .with_type(error_types::EXECUTION_TIMEOUT);
            store.fail_task(task_id, &error).await.map(|_| ())
        }
    };

    if let Err(e) = report {
        error!(%task_id, "failed to report task outcome: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use crate::persistence::{
        IdReusePolicy, InMemoryExecutionStore, NewExecution, TaskDefinition, TaskOutcome,
    };
    use crate::workflow::ActivityOptions;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct SleepInput {
        ms: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct SleepOutput {
        slept_ms: u64,
    }

    struct SleepActivity;

    #[async_trait]
    impl Activity for SleepActivity {
        const TYPE: &'static str = "sleep";
        type Input = SleepInput;
        type Output = SleepOutput;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            tokio::time::sleep(Duration::from_millis(input.ms)).await;
            Ok(SleepOutput { slept_ms: input.ms })
        }
    }

    async fn seed_task(store: &Arc<InMemoryExecutionStore>, activity_type: &str) -> Uuid {
        let run_id = Uuid::now_v7();
        store
            .create_execution(NewExecution {
                workflow_id: format!("wf-{run_id}"),
                run_id,
                workflow_type: "test".to_string(),
                tenant: "tenant-a".to_string(),
                input: json!({}),
                parent: None,
                run_timeout: None,
                id_reuse_policy: IdReusePolicy::AllowDuplicate,
            })
            .await
            .unwrap();

        store
            .enqueue_task(
                TaskDefinition {
                    workflow_id: format!("wf-{run_id}"),
                    run_id,
                    scheduled_event_id: 1,
                    activity_id: "a-1".to_string(),
                    activity_type: activity_type.to_string(),
                    queue: TaskQueue::General,
                    input: json!({"ms": 5}),
                    options: ActivityOptions::default(),
                },
                Utc::now(),
            )
            .await
            .unwrap()
    }

    async fn wait_for_reports(
        store: &Arc<InMemoryExecutionStore>,
        want: usize,
    ) -> Vec<crate::persistence::CompletionReport> {
        let mut collected = vec![];
        for _ in 0..100 {
            collected.extend(store.take_completion_reports(100).await.unwrap());
            if collected.len() >= want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        collected
    }

    #[tokio::test]
    async fn test_pool_executes_task() {
        let store = Arc::new(InMemoryExecutionStore::new());
        seed_task(&store, "sleep").await;

        let mut activities = ActivitySet::new();
        activities.register(SleepActivity);

        let config = WorkerPoolConfig::new(TaskQueue::General)
            .with_poller(PollerConfig::new().with_min_interval(Duration::from_millis(10)));
        let pool = WorkerPool::new(store.clone() as Arc<dyn ExecutionStore>, config, activities);

        pool.start().await.unwrap();

        let reports = wait_for_reports(&store, 2).await;
        assert!(reports
            .iter()
            .any(|r| matches!(r.outcome, TaskOutcome::Started { .. })));
        assert!(reports.iter().any(|r| matches!(
            &r.outcome,
            TaskOutcome::Completed { result } if result["slept_ms"] == 5
        )));

        pool.drain().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_unregistered_activity_fails_non_retryable() {
        let store = Arc::new(InMemoryExecutionStore::new());
        seed_task(&store, "unknown_activity").await;

        let config = WorkerPoolConfig::new(TaskQueue::General)
            .with_poller(PollerConfig::new().with_min_interval(Duration::from_millis(10)));
        // Pool with a registered type so the poller claims everything on the
        // queue; resolution happens post-claim.
        let mut activities = ActivitySet::new();
        activities.register(SleepActivity);
        let pool = WorkerPool::new(store.clone() as Arc<dyn ExecutionStore>, config, activities);

        // The poller filters by registered activity types, so the unknown
        // task stays pending rather than being claimed by this pool.
        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.pending_task_count(), 1);

        pool.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_readiness() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let pool = WorkerPool::new(
            store as Arc<dyn ExecutionStore>,
            WorkerPoolConfig::new(TaskQueue::Storage),
            ActivitySet::new(),
        );

        assert!(!pool.is_live());
        assert!(!pool.is_ready());

        pool.start().await.unwrap();
        assert!(pool.is_live());
        assert!(pool.is_ready());

        pool.drain().await.unwrap();
        assert!(!pool.is_ready());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let pool = WorkerPool::new(
            store as Arc<dyn ExecutionStore>,
            WorkerPoolConfig::new(TaskQueue::General),
            ActivitySet::new(),
        );

        pool.start().await.unwrap();
        assert!(matches!(
            pool.start().await,
            Err(WorkerPoolError::AlreadyRunning)
        ));
        pool.drain().await.unwrap();
    }
}
