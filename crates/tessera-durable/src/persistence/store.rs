//! ExecutionStore trait definition
//!
//! The store is the only globally shared mutable state in the engine.
//! History appends use optimistic concurrency keyed by the expected next
//! event id; task claims are exclusive leases; completion reports are staged
//! by the task operations and drained by the engine's completion pump,
//! idempotent by `(run_id, scheduled_event_id, attempt)`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::router::TaskQueue;
use crate::workflow::attributes::{AttributeFilter, AttributeMap};
use crate::workflow::{ActivityOptions, EventKind, HistoryEvent, Signal, TimeoutKind, WorkflowError};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No execution exists for the workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No run exists with the given run id
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Start rejected by the id-reuse policy
    #[error("workflow already started: {0}")]
    AlreadyStarted(String),

    /// Signal channel at capacity
    #[error("signal channel full for workflow {0}")]
    ChannelFull(String),

    /// Optimistic history append lost the race
    #[error("concurrency conflict: expected event id {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Terminal and non-terminal states of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Terminated,
    ContinuedAsNew,
}

impl WorkflowStatus {
    /// Whether this run will never process another event.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Terminated => "terminated",
            Self::ContinuedAsNew => "continued_as_new",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "terminated" => Ok(Self::Terminated),
            "continued_as_new" => Ok(Self::ContinuedAsNew),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// What happens when a start request reuses an existing workflow id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdReusePolicy {
    /// Always allowed; a new run replaces the closed one.
    #[default]
    AllowDuplicate,

    /// Allowed only when the previous run did not complete successfully.
    AllowDuplicateFailedOnly,

    /// Rejected while any run exists for the id.
    RejectDuplicate,
}

/// One-way reference from a child run to the execution that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub workflow_id: String,
    pub run_id: Uuid,
}

/// A workflow run as persisted.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub tenant: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub parent: Option<ParentRef>,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub run_timeout: Option<Duration>,
}

/// Parameters for creating a run.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub tenant: String,
    pub input: serde_json::Value,
    pub parent: Option<ParentRef>,
    pub run_timeout: Option<Duration>,
    pub id_reuse_policy: IdReusePolicy,
}

/// Definition of an activity task to be enqueued.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub workflow_id: String,
    pub run_id: Uuid,
    /// Event id of the ActivityScheduled event; completion is idempotent on
    /// `(run_id, scheduled_event_id)`.
    pub scheduled_event_id: i64,
    pub activity_id: String,
    pub activity_type: String,
    pub queue: TaskQueue,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// A task under an exclusive lease.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub scheduled_event_id: i64,
    pub activity_id: String,
    pub activity_type: String,
    pub queue: TaskQueue,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    /// 1-based attempt number under this lease.
    pub attempt: u32,
}

/// Response from a heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    /// Whether the lease was renewed.
    pub accepted: bool,

    /// Whether the workflow requested cancellation of this activity.
    pub cancel_requested: bool,
}

/// Outcome of failing (or timing out) a task.
#[derive(Debug, Clone)]
pub enum TaskFailureOutcome {
    /// Re-enqueued with a backoff delay.
    WillRetry { next_attempt: u32, delay: Duration },

    /// No further attempts; the failure is final for the workflow.
    Exhausted,
}

/// A task that violated one of its timeout classes.
#[derive(Debug, Clone)]
pub struct TimedOutTask {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub activity_id: String,
    pub timeout: TimeoutKind,
}

/// Attempt lifecycle outcome, staged for the completion pump.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// A worker took the lease; recorded as ActivityStarted.
    Started { worker_id: String },
    Completed { result: serde_json::Value },
    Failed { error: ActivityError, will_retry: bool },
    TimedOut { timeout: TimeoutKind, will_retry: bool },
}

/// A staged attempt outcome awaiting application to workflow history.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub task_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub scheduled_event_id: i64,
    pub activity_id: String,
    pub attempt: u32,
    pub outcome: TaskOutcome,
}

/// A timer that reached its fire time.
#[derive(Debug, Clone)]
pub struct DueTimer {
    pub run_id: Uuid,
    pub timer_id: String,
}

/// Inbox signal categories pushed to principals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxKind {
    Status,
    Progress,
    Completion,
    Error,
}

/// A persisted per-principal inbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxSignal {
    pub principal: String,
    /// Strictly increasing within a principal's inbox; subscribers dedup on
    /// `(principal, sequence)`.
    pub sequence: i64,
    pub workflow_id: String,
    pub kind: InboxKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Worker registration info (readiness reporting).
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: String,
    pub queue: TaskQueue,
    pub activity_types: Vec<String>,
    pub max_concurrency: u32,
    pub current_load: u32,
    pub accepting_tasks: bool,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Store for workflow executions, history, task queues, timers, signals,
/// search attributes and principal inboxes.
///
/// Implementations must be thread-safe and support concurrent access from
/// the executor, the engine runtime and many worker pools.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Execution Operations
    // =========================================================================

    /// Create a run, enforcing the id-reuse policy against prior runs of the
    /// same workflow id.
    async fn create_execution(&self, new: NewExecution) -> Result<(), StoreError>;

    /// The latest run for a workflow id.
    async fn get_execution(&self, workflow_id: &str) -> Result<ExecutionRecord, StoreError>;

    /// A specific run.
    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRecord, StoreError>;

    /// Update a run's status (and result/error on close).
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    /// Running runs whose run_timeout elapsed before `now`.
    async fn runs_past_timeout(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// List latest runs, optionally restricted to a tenant.
    async fn list_executions(
        &self,
        tenant: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    // =========================================================================
    // History Operations
    // =========================================================================

    /// Append events to a run's history with optimistic concurrency.
    ///
    /// `expected_next_event_id` must equal the current history length;
    /// returns the new next event id.
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_next_event_id: i64,
        events: Vec<EventKind>,
    ) -> Result<i64, StoreError>;

    /// Load a run's full history in event-id order (for replay).
    async fn load_history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Enqueue an activity task, visible to claims at `visible_at`.
    async fn enqueue_task(
        &self,
        task: TaskDefinition,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError>;

    /// Claim up to `max_tasks` visible tasks from a queue under an exclusive
    /// lease. Claims are ordered by `(visible_at, task_id)` so tasks of one
    /// `(workflow, activity_type)` arrive in schedule order.
    async fn claim_tasks(
        &self,
        queue: TaskQueue,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Record a task heartbeat, renewing the lease.
    async fn record_heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Complete a task. Returns false when the task was not under a live
    /// lease (duplicate report); duplicates stage nothing.
    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Fail a task attempt; the router's retry policy decides between
    /// re-enqueue with delay and final failure.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Apply a timeout class to a task (lease revoked, retry per policy;
    /// schedule-to-start and schedule-to-close are final).
    async fn time_out_task(
        &self,
        task_id: Uuid,
        timeout: TimeoutKind,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Flag a pending or running task for cancellation. Pending tasks are
    /// dropped immediately; running ones observe the flag via heartbeat.
    async fn request_cancel(&self, run_id: Uuid, activity_id: &str) -> Result<bool, StoreError>;

    /// Tasks currently violating a timeout class.
    async fn find_timed_out_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimedOutTask>, StoreError>;

    /// Number of pending (visible or delayed) tasks on a queue.
    async fn queue_depth(&self, queue: TaskQueue) -> Result<usize, StoreError>;

    /// Drain staged attempt outcomes for the completion pump.
    async fn take_completion_reports(
        &self,
        max: usize,
    ) -> Result<Vec<CompletionReport>, StoreError>;

    // =========================================================================
    // Timer Operations
    // =========================================================================

    /// Persist a timer for a run.
    async fn schedule_timer(
        &self,
        run_id: Uuid,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove and return timers with `fire_at <= now`.
    async fn pop_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, StoreError>;

    // =========================================================================
    // Signal Operations
    // =========================================================================

    /// Push a signal onto a run's channel; rejects past the channel bound.
    async fn push_signal(&self, run_id: Uuid, signal: Signal) -> Result<(), StoreError>;

    /// Pending signals in delivery order.
    async fn pending_signals(&self, run_id: Uuid) -> Result<Vec<Signal>, StoreError>;

    /// Drop the first `count` pending signals after they were consumed.
    async fn mark_signals_processed(&self, run_id: Uuid, count: usize) -> Result<(), StoreError>;

    // =========================================================================
    // Search Attribute Operations
    // =========================================================================

    /// Merge attributes into a run's indexed attribute map.
    async fn upsert_search_attributes(
        &self,
        workflow_id: &str,
        run_id: Uuid,
        attributes: &AttributeMap,
    ) -> Result<(), StoreError>;

    /// A run's current attribute map.
    async fn get_search_attributes(&self, run_id: Uuid) -> Result<AttributeMap, StoreError>;

    /// Executions whose attributes satisfy the filter.
    async fn query_executions(
        &self,
        filter: &AttributeFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    // =========================================================================
    // Inbox Operations
    // =========================================================================

    /// Append to a principal's inbox, assigning the next sequence number.
    async fn append_inbox(
        &self,
        principal: &str,
        workflow_id: &str,
        kind: InboxKind,
        payload: serde_json::Value,
    ) -> Result<InboxSignal, StoreError>;

    /// Page through a principal's inbox, newest first.
    async fn list_inbox(
        &self,
        principal: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<InboxSignal>, StoreError>;

    /// Inbox entries after a sequence, oldest first (subscriber catch-up).
    async fn inbox_after(
        &self,
        principal: &str,
        after_sequence: i64,
    ) -> Result<Vec<InboxSignal>, StoreError>;

    /// Mark one inbox entry read. Returns false when unknown.
    async fn mark_inbox_read(&self, principal: &str, sequence: i64) -> Result<bool, StoreError>;

    /// Count of unread inbox entries.
    async fn unread_inbox_count(&self, principal: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Worker Registry Operations (optional, default no-op)
    // =========================================================================

    async fn register_worker(&self, _worker: WorkerInfo) -> Result<(), StoreError> {
        Ok(())
    }

    async fn worker_heartbeat(
        &self,
        _worker_id: &str,
        _current_load: usize,
        _accepting_tasks: bool,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn deregister_worker(&self, _worker_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        Ok(vec![])
    }
}
