//! Engine background runtime
//!
//! Runs the sweeps that keep executions moving between external events:
//! - completion pump: applies staged task attempt outcomes to histories
//! - timer sweep: fires due timers (at-or-after, never early)
//! - task timeout sweep: enforces schedule-to-start, start-to-close,
//!   heartbeat and schedule-to-close
//! - run timeout sweep: fails runs past their run_timeout
//!
//! Loops follow the worker-pool pattern: tokio tasks with a shared watch
//! channel for shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::persistence::ExecutionStore;

use super::executor::{ExecutorError, WorkflowExecutor};

/// Sweep intervals.
#[derive(Debug, Clone)]
pub struct EngineRuntimeConfig {
    /// How often staged completions are pumped into histories.
    pub pump_interval: Duration,

    /// How often due timers are fired.
    pub timer_interval: Duration,

    /// How often task timeout classes are checked.
    pub timeout_interval: Duration,

    /// How often run timeouts are checked.
    pub run_timeout_interval: Duration,

    /// Max completions applied per pump pass.
    pub pump_batch_size: usize,
}

impl Default for EngineRuntimeConfig {
    fn default() -> Self {
        Self {
            pump_interval: Duration::from_millis(100),
            timer_interval: Duration::from_millis(250),
            timeout_interval: Duration::from_secs(1),
            run_timeout_interval: Duration::from_secs(5),
            pump_batch_size: 100,
        }
    }
}

/// Background runtime driving an executor's sweeps.
pub struct EngineRuntime {
    executor: Arc<WorkflowExecutor>,
    store: Arc<dyn ExecutionStore>,
    config: EngineRuntimeConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl EngineRuntime {
    pub fn new(executor: Arc<WorkflowExecutor>) -> Self {
        Self::with_config(executor, EngineRuntimeConfig::default())
    }

    pub fn with_config(executor: Arc<WorkflowExecutor>, config: EngineRuntimeConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store: Arc::clone(executor.store()),
            executor,
            config,
            shutdown_tx,
            shutdown_rx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Start all sweep loops.
    pub fn start(&self) {
        info!("starting engine runtime");

        let mut handles = self.handles.lock();
        handles.push(self.spawn_loop(self.config.pump_interval, {
            let executor = Arc::clone(&self.executor);
            let batch = self.config.pump_batch_size;
            move || {
                let executor = Arc::clone(&executor);
                async move {
                    executor.pump_completions(batch).await.map(|applied| {
                        if applied > 0 {
                            debug!(applied, "pumped attempt outcomes");
                        }
                    })
                }
            }
        }));

        handles.push(self.spawn_loop(self.config.timer_interval, {
            let executor = Arc::clone(&self.executor);
            let store = Arc::clone(&self.store);
            move || {
                let executor = Arc::clone(&executor);
                let store = Arc::clone(&store);
                async move { fire_due_timers(&executor, &store).await }
            }
        }));

        handles.push(self.spawn_loop(self.config.timeout_interval, {
            let store = Arc::clone(&self.store);
            move || {
                let store = Arc::clone(&store);
                async move { enforce_task_timeouts(&store).await }
            }
        }));

        handles.push(self.spawn_loop(self.config.run_timeout_interval, {
            let executor = Arc::clone(&self.executor);
            let store = Arc::clone(&self.store);
            move || {
                let executor = Arc::clone(&executor);
                let store = Arc::clone(&store);
                async move { enforce_run_timeouts(&executor, &store).await }
            }
        }));
    }

    /// Stop all loops and wait for them to exit.
    pub async fn shutdown(&self) {
        info!("stopping engine runtime");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Run one pass of every sweep; lets tests advance the engine
    /// deterministically without the background loops.
    pub async fn tick(&self) -> Result<(), ExecutorError> {
        enforce_task_timeouts(&self.store).await?;
        self.executor
            .pump_completions(self.config.pump_batch_size)
            .await?;
        fire_due_timers(&self.executor, &self.store).await?;
        enforce_run_timeouts(&self.executor, &self.store).await?;
        self.executor
            .pump_completions(self.config.pump_batch_size)
            .await?;
        Ok(())
    }

    fn spawn_loop<F, Fut>(&self, interval: Duration, mut body: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), ExecutorError>> + Send,
    {
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = body().await {
                            error!("engine sweep failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("engine sweep loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

async fn fire_due_timers(
    executor: &WorkflowExecutor,
    store: &Arc<dyn ExecutionStore>,
) -> Result<(), ExecutorError> {
    let due = store.pop_due_timers(Utc::now()).await?;
    for timer in due {
        debug!(run_id = %timer.run_id, timer_id = %timer.timer_id, "timer fired");
        executor.on_timer_fired(timer.run_id, &timer.timer_id).await?;
    }
    Ok(())
}

async fn enforce_task_timeouts(store: &Arc<dyn ExecutionStore>) -> Result<(), ExecutorError> {
    let timed_out = store.find_timed_out_tasks(Utc::now()).await?;
    for task in timed_out {
        debug!(
            task_id = %task.task_id,
            activity_id = %task.activity_id,
            timeout = ?task.timeout,
            "task timed out"
        );
        store.time_out_task(task.task_id, task.timeout).await?;
    }
    Ok(())
}

async fn enforce_run_timeouts(
    executor: &WorkflowExecutor,
    store: &Arc<dyn ExecutionStore>,
) -> Result<(), ExecutorError> {
    let expired = store.runs_past_timeout(Utc::now()).await?;
    for record in expired {
        executor.fail_run_timed_out(record.run_id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryExecutionStore, WorkflowStatus};
    use crate::workflow::{Decision, Signal, Workflow, WorkflowContext, WorkflowError};
    use crate::StartOptions;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct WaitInput {
        wait_ms: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct WaitOutput {
        waited: bool,
    }

    /// Starts a timer and completes when it fires.
    struct WaitWorkflow {
        wait_ms: u64,
        finished: bool,
    }

    impl Workflow for WaitWorkflow {
        const TYPE: &'static str = "wait";
        type Input = WaitInput;
        type Output = WaitOutput;

        fn new(input: Self::Input) -> Self {
            Self {
                wait_ms: input.wait_ms,
                finished: false,
            }
        }

        fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<Decision> {
            vec![Decision::timer("wait", Duration::from_millis(self.wait_ms))]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &WorkflowContext,
            _activity_id: &str,
            _result: serde_json::Value,
        ) -> Vec<Decision> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &WorkflowContext,
            _activity_id: &str,
            _error: &crate::activity::ActivityError,
        ) -> Vec<Decision> {
            vec![]
        }

        fn on_timer_fired(&mut self, _ctx: &WorkflowContext, timer_id: &str) -> Vec<Decision> {
            if timer_id == "wait" {
                self.finished = true;
                return vec![Decision::complete(json!({"waited": true}))];
            }
            vec![]
        }

        fn on_signal(&mut self, _ctx: &WorkflowContext, _signal: &Signal) -> Vec<Decision> {
            vec![]
        }

        fn is_finished(&self) -> bool {
            self.finished
        }

        fn result(&self) -> Option<Self::Output> {
            self.finished.then_some(WaitOutput { waited: true })
        }

        fn error(&self) -> Option<WorkflowError> {
            None
        }
    }

    #[tokio::test]
    async fn test_timer_fires_through_tick() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let mut executor = WorkflowExecutor::new(store.clone() as Arc<dyn ExecutionStore>);
        executor.register::<WaitWorkflow>();
        let executor = Arc::new(executor);

        let run_id = executor
            .start_workflow::<WaitWorkflow>(
                "wait-1",
                WaitInput { wait_ms: 0 },
                StartOptions::new("tenant-a"),
            )
            .await
            .unwrap();

        let runtime = EngineRuntime::new(Arc::clone(&executor));
        runtime.tick().await.unwrap();

        let record = store.get_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_timeout_fails_run() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let mut executor = WorkflowExecutor::new(store.clone() as Arc<dyn ExecutionStore>);
        executor.register::<WaitWorkflow>();
        let executor = Arc::new(executor);

        let run_id = executor
            .start_workflow::<WaitWorkflow>(
                "wait-2",
                WaitInput { wait_ms: 600_000 },
                StartOptions::new("tenant-a").with_run_timeout(Duration::ZERO),
            )
            .await
            .unwrap();

        let runtime = EngineRuntime::new(Arc::clone(&executor));
        runtime.tick().await.unwrap();

        let record = store.get_run(run_id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::TimedOut);
        assert_eq!(record.error.unwrap().code.as_deref(), Some("TimedOut"));
    }

    #[tokio::test]
    async fn test_runtime_start_and_shutdown() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let executor = Arc::new(WorkflowExecutor::new(store as Arc<dyn ExecutionStore>));

        let runtime = EngineRuntime::with_config(
            executor,
            EngineRuntimeConfig {
                pump_interval: Duration::from_millis(10),
                timer_interval: Duration::from_millis(10),
                timeout_interval: Duration::from_millis(10),
                run_timeout_interval: Duration::from_millis(10),
                pump_batch_size: 10,
            },
        );

        runtime.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        runtime.shutdown().await;
    }
}
