//! Task-queue routing
//!
//! Translates an in-workflow "schedule activity" decision into a persisted
//! task on exactly one of the three queues. The scheduling workflow may name
//! a queue explicitly; otherwise the routing table below applies.
//!
//! Admission never rejects. Each queue carries a soft depth threshold; when
//! the depth crosses it the router flips a saturation flag (and logs at WARN)
//! for autoscaling to consume, but the task is still admitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::persistence::{ExecutionStore, StoreError, TaskDefinition};

/// The three activity queues, partitioned by resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskQueue {
    /// Model inference and other accelerator-bound work.
    AiProcessing,
    /// Vector/graph/metadata writes and blob downloads.
    Storage,
    /// Coordination, validation, notification, review plumbing.
    General,
}

impl TaskQueue {
    pub const ALL: [TaskQueue; 3] = [Self::AiProcessing, Self::Storage, Self::General];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiProcessing => "ai-processing",
            Self::Storage => "storage",
            Self::General => "general",
        }
    }

    /// Per-worker concurrency cap for this queue class.
    pub fn concurrency_cap(&self) -> usize {
        match self {
            Self::AiProcessing => 5,
            Self::Storage => 20,
            Self::General => 50,
        }
    }

    /// Soft depth threshold; beyond this the router signals saturation.
    pub fn depth_threshold(&self) -> usize {
        match self {
            Self::AiProcessing => 100,
            Self::Storage => 500,
            Self::General => 1000,
        }
    }

    /// Default queue for an activity type when the scheduling decision does
    /// not name one.
    pub fn default_for(activity_type: &str) -> TaskQueue {
        match activity_type {
            "extract_text_and_chunk"
            | "assess_relevance"
            | "generate_embeddings"
            | "extract_graph_entities"
            | "generate_answer"
            | "score_confidence"
            | "extract_topics"
            | "summarize_document" => Self::AiProcessing,
            "download_blob"
            | "upsert_vector_index"
            | "upsert_graph"
            | "delete_from_vector_index"
            | "delete_from_graph"
            | "vector_search"
            | "graph_neighbors"
            | "update_metadata"
            | "archive_document"
            | "persist_answer"
            | "publish_reviewable"
            | "archive_reviewable"
            | "update_quality_scores" => Self::Storage,
            _ => Self::General,
        }
    }
}

impl std::str::FromStr for TaskQueue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai-processing" => Ok(Self::AiProcessing),
            "storage" => Ok(Self::Storage),
            "general" => Ok(Self::General),
            other => Err(format!("unknown task queue: {other}")),
        }
    }
}

impl std::fmt::Display for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routes activity tasks onto queues and tracks saturation.
pub struct QueueRouter {
    store: Arc<dyn ExecutionStore>,
    saturated: [AtomicBool; 3],
}

impl QueueRouter {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            saturated: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    /// Persist a task on its queue, becoming visible at `visible_at`.
    ///
    /// Admission always succeeds; saturation is signalled out of band.
    pub async fn admit(
        &self,
        task: TaskDefinition,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let queue = task.queue;
        let task_id = self.store.enqueue_task(task, visible_at).await?;

        let depth = self.store.queue_depth(queue).await?;
        self.update_saturation(queue, depth);

        debug!(%task_id, queue = %queue, depth, "task admitted");
        Ok(task_id)
    }

    /// Whether a queue is currently past its soft depth threshold.
    pub fn is_saturated(&self, queue: TaskQueue) -> bool {
        self.saturated[Self::index(queue)].load(Ordering::Relaxed)
    }

    fn update_saturation(&self, queue: TaskQueue, depth: usize) {
        let flag = &self.saturated[Self::index(queue)];
        let over = depth > queue.depth_threshold();
        let was = flag.swap(over, Ordering::Relaxed);
        if over && !was {
            warn!(
                queue = %queue,
                depth,
                threshold = queue.depth_threshold(),
                "queue depth exceeds soft threshold"
            );
        }
    }

    fn index(queue: TaskQueue) -> usize {
        match queue {
            TaskQueue::AiProcessing => 0,
            TaskQueue::Storage => 1,
            TaskQueue::General => 2,
        }
    }
}
