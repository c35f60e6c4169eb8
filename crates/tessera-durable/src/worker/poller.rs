//! Task polling with adaptive backoff
//!
//! Long-polls one task queue: the interval shrinks to the minimum while
//! tasks flow and backs off exponentially while the queue is idle.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::persistence::{ClaimedTask, ExecutionStore, StoreError};
use crate::reliability::retry::duration_millis;
use crate::router::TaskQueue;

/// Polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Minimum poll interval (while tasks are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (while idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier applied after an empty poll
    pub backoff_multiplier: f64,

    /// Maximum tasks to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Task poller with adaptive backoff over a single queue.
pub struct TaskPoller {
    store: Arc<dyn ExecutionStore>,
    queue: TaskQueue,
    worker_id: String,
    activity_types: Vec<String>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        queue: TaskQueue,
        worker_id: String,
        activity_types: Vec<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            queue,
            worker_id,
            activity_types,
            config: config.clone(),
            current_interval: config.min_interval,
            shutdown_rx,
        }
    }

    /// Claim up to `max_tasks` tasks and adjust the backoff state.
    pub async fn poll(&mut self, max_tasks: usize) -> Result<Vec<ClaimedTask>, StoreError> {
        if *self.shutdown_rx.borrow() {
            debug!(worker_id = %self.worker_id, "poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_tasks.min(self.config.batch_size);
        let tasks = self
            .store
            .claim_tasks(self.queue, &self.worker_id, &self.activity_types, batch_size)
            .await?;

        if tasks.is_empty() {
            self.increase_backoff();
            trace!(
                queue = %self.queue,
                interval_ms = self.current_interval.as_millis(),
                "no tasks found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(queue = %self.queue, count = tasks.len(), "claimed tasks");
        }

        Ok(tasks)
    }

    /// Wait out the current interval; true means shutdown was signalled.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}
