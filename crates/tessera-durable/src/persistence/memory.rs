//! In-memory implementation of ExecutionStore
//!
//! Mirrors the PostgreSQL store's semantics and backs every unit and
//! integration test. All data lives behind `parking_lot` locks.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::router::TaskQueue;
use crate::workflow::attributes::{AttributeFilter, AttributeMap};
use crate::workflow::signal::SIGNAL_CHANNEL_CAPACITY;
use crate::workflow::{EventKind, HistoryEvent, Signal, TimeoutKind, WorkflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

/// Internal run state
struct RunState {
    workflow_id: String,
    workflow_type: String,
    tenant: String,
    status: WorkflowStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    parent: Option<ParentRef>,
    started_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    run_timeout: Option<std::time::Duration>,
    events: Vec<HistoryEvent>,
    signals: Vec<Signal>,
    attributes: AttributeMap,
}

impl RunState {
    fn record(&self, run_id: Uuid) -> ExecutionRecord {
        ExecutionRecord {
            workflow_id: self.workflow_id.clone(),
            run_id,
            workflow_type: self.workflow_type.clone(),
            tenant: self.tenant.clone(),
            status: self.status,
            input: self.input.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            parent: self.parent.clone(),
            started_at: self.started_at,
            closed_at: self.closed_at,
            run_timeout: self.run_timeout,
        }
    }
}

/// Internal task state
struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    claimed_by: Option<String>,
    scheduled_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
}

/// In-memory implementation of ExecutionStore
///
/// # Example
///
/// ```
/// use tessera_durable::InMemoryExecutionStore;
///
/// let store = InMemoryExecutionStore::new();
/// ```
pub struct InMemoryExecutionStore {
    runs: RwLock<HashMap<Uuid, RunState>>,
    /// Runs per workflow id, in creation order (latest last).
    workflow_runs: RwLock<HashMap<String, Vec<Uuid>>>,
    tasks: RwLock<HashMap<Uuid, TaskState>>,
    timers: RwLock<Vec<(Uuid, String, DateTime<Utc>)>>,
    reports: Mutex<VecDeque<CompletionReport>>,
    inbox: RwLock<HashMap<String, Vec<InboxSignal>>>,
    workers: RwLock<HashMap<String, WorkerInfo>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            workflow_runs: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            timers: RwLock::new(Vec::new()),
            reports: Mutex::new(VecDeque::new()),
            inbox: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Number of pending tasks across all queues (test helper).
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Number of runs (test helper).
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    fn latest_run_id(&self, workflow_id: &str) -> Option<Uuid> {
        self.workflow_runs
            .read()
            .get(workflow_id)
            .and_then(|runs| runs.last().copied())
    }

    /// Whether a failed attempt gets another try.
    fn retry_decision(
        task: &TaskState,
        retryable: bool,
        error_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<std::time::Duration> {
        let policy = &task.definition.options.retry_policy;

        if !retryable || !policy.should_retry(error_type) {
            return None;
        }
        if !policy.has_attempts_remaining(task.attempt) {
            return None;
        }
        if let Some(s2c) = task.definition.options.schedule_to_close_timeout {
            if now >= task.scheduled_at + chrono::Duration::from_std(s2c).unwrap_or_default() {
                return None;
            }
        }

        Some(policy.delay_after_attempt(task.attempt))
    }

    fn stage_report(&self, task: &TaskState, task_id: Uuid, outcome: TaskOutcome) {
        self.reports.lock().push_back(CompletionReport {
            task_id,
            workflow_id: task.definition.workflow_id.clone(),
            run_id: task.definition.run_id,
            scheduled_event_id: task.definition.scheduled_event_id,
            activity_id: task.definition.activity_id.clone(),
            attempt: task.attempt,
            outcome,
        });
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, new: NewExecution) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let mut workflow_runs = self.workflow_runs.write();

        if let Some(prior) = workflow_runs
            .get(&new.workflow_id)
            .and_then(|ids| ids.last())
            .and_then(|id| runs.get(id).map(|r| r.status))
        {
            let rejected = if !prior.is_terminal() {
                // Never two live runs for one workflow id.
                true
            } else {
                match new.id_reuse_policy {
                    IdReusePolicy::AllowDuplicate => false,
                    IdReusePolicy::AllowDuplicateFailedOnly => prior == WorkflowStatus::Completed,
                    IdReusePolicy::RejectDuplicate => true,
                }
            };

            if rejected {
                return Err(StoreError::AlreadyStarted(new.workflow_id));
            }
        }

        runs.insert(
            new.run_id,
            RunState {
                workflow_id: new.workflow_id.clone(),
                workflow_type: new.workflow_type,
                tenant: new.tenant,
                status: WorkflowStatus::Running,
                input: new.input,
                result: None,
                error: None,
                parent: new.parent,
                started_at: Utc::now(),
                closed_at: None,
                run_timeout: new.run_timeout,
                events: vec![],
                signals: vec![],
                attributes: AttributeMap::new(),
            },
        );
        workflow_runs
            .entry(new.workflow_id)
            .or_default()
            .push(new.run_id);

        Ok(())
    }

    async fn get_execution(&self, workflow_id: &str) -> Result<ExecutionRecord, StoreError> {
        let run_id = self
            .latest_run_id(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        self.get_run(run_id).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let runs = self.runs.read();
        runs.get(&run_id)
            .map(|r| r.record(run_id))
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        run.status = status;
        if status.is_terminal() {
            run.closed_at = Some(Utc::now());
        }
        if result.is_some() {
            run.result = result;
        }
        if error.is_some() {
            run.error = error;
        }
        Ok(())
    }

    async fn runs_past_timeout(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let runs = self.runs.read();
        Ok(runs
            .iter()
            .filter(|(_, r)| r.status == WorkflowStatus::Running)
            .filter(|(_, r)| {
                r.run_timeout
                    .and_then(|t| chrono::Duration::from_std(t).ok())
                    .map(|t| r.started_at + t <= now)
                    .unwrap_or(false)
            })
            .map(|(id, r)| r.record(*id))
            .collect())
    }

    async fn list_executions(
        &self,
        tenant: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let runs = self.runs.read();
        let workflow_runs = self.workflow_runs.read();

        let mut records: Vec<_> = workflow_runs
            .values()
            .filter_map(|ids| ids.last())
            .filter_map(|id| runs.get(id).map(|r| r.record(*id)))
            .filter(|r| tenant.map(|t| r.tenant == t).unwrap_or(true))
            .collect();

        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_next_event_id: i64,
        events: Vec<EventKind>,
    ) -> Result<i64, StoreError> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        let current = run.events.len() as i64;
        if current != expected_next_event_id {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_next_event_id,
                actual: current,
            });
        }

        let now = Utc::now();
        for (offset, kind) in events.into_iter().enumerate() {
            run.events.push(HistoryEvent {
                event_id: current + offset as i64,
                timestamp: now,
                kind,
            });
        }

        Ok(run.events.len() as i64)
    }

    async fn load_history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let runs = self.runs.read();
        let run = runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(run.events.clone())
    }

    async fn enqueue_task(
        &self,
        task: TaskDefinition,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        self.tasks.write().insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                claimed_by: None,
                scheduled_at: Utc::now(),
                visible_at,
                started_at: None,
                last_heartbeat_at: None,
                cancel_requested: false,
            },
        );
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        queue: TaskQueue,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();

        let mut candidates: Vec<Uuid> = tasks
            .iter()
            .filter(|(_, t)| {
                t.status == TaskStatus::Pending
                    && t.definition.queue == queue
                    && t.visible_at <= now
                    && (activity_types.is_empty()
                        || activity_types.contains(&t.definition.activity_type))
            })
            .map(|(id, _)| *id)
            .collect();

        // (visible_at, id) order keeps per-workflow activity delivery in
        // schedule order; task ids are uuid v7 and therefore time-sorted.
        candidates.sort_by_key(|id| (tasks[id].visible_at, *id));
        candidates.truncate(max_tasks);

        let mut claimed = Vec::with_capacity(candidates.len());
        for task_id in candidates {
            let Some(task) = tasks.get_mut(&task_id) else {
                continue;
            };
            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(worker_id.to_string());
            task.attempt += 1;
            task.started_at = Some(now);
            task.last_heartbeat_at = Some(now);

            self.stage_report(
                task,
                task_id,
                TaskOutcome::Started {
                    worker_id: worker_id.to_string(),
                },
            );

            claimed.push(ClaimedTask {
                task_id,
                workflow_id: task.definition.workflow_id.clone(),
                run_id: task.definition.run_id,
                scheduled_event_id: task.definition.scheduled_event_id,
                activity_id: task.definition.activity_id.clone(),
                activity_type: task.definition.activity_type.clone(),
                queue: task.definition.queue,
                input: task.definition.input.clone(),
                options: task.definition.options.clone(),
                attempt: task.attempt,
            });
        }

        Ok(claimed)
    }

    async fn record_heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        _details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let holds_lease =
            task.status == TaskStatus::Claimed && task.claimed_by.as_deref() == Some(worker_id);

        if holds_lease {
            task.last_heartbeat_at = Some(Utc::now());
        }

        Ok(HeartbeatResponse {
            accepted: holds_lease,
            cancel_requested: task.cancel_requested,
        })
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Claimed {
            return Ok(false);
        }

        task.status = TaskStatus::Completed;
        self.stage_report(task, task_id, TaskOutcome::Completed { result });
        Ok(true)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        match Self::retry_decision(task, error.retryable, error.error_type.as_deref(), now) {
            Some(delay) => {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.started_at = None;
                task.visible_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

                self.stage_report(
                    task,
                    task_id,
                    TaskOutcome::Failed {
                        error: error.clone(),
                        will_retry: true,
                    },
                );

                Ok(TaskFailureOutcome::WillRetry {
                    next_attempt: task.attempt + 1,
                    delay,
                })
            }
            None => {
                task.status = TaskStatus::Failed;
                self.stage_report(
                    task,
                    task_id,
                    TaskOutcome::Failed {
                        error: error.clone(),
                        will_retry: false,
                    },
                );
                Ok(TaskFailureOutcome::Exhausted)
            }
        }
    }

    async fn time_out_task(
        &self,
        task_id: Uuid,
        timeout: TimeoutKind,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        // Start and overall-budget timeouts are final; attempt timeouts
        // retry per policy.
        let retryable = matches!(timeout, TimeoutKind::StartToClose | TimeoutKind::Heartbeat);

        match Self::retry_decision(task, retryable, None, now) {
            Some(delay) if retryable => {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.started_at = None;
                task.visible_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

                self.stage_report(
                    task,
                    task_id,
                    TaskOutcome::TimedOut {
                        timeout,
                        will_retry: true,
                    },
                );

                Ok(TaskFailureOutcome::WillRetry {
                    next_attempt: task.attempt + 1,
                    delay,
                })
            }
            _ => {
                task.status = TaskStatus::Failed;
                self.stage_report(
                    task,
                    task_id,
                    TaskOutcome::TimedOut {
                        timeout,
                        will_retry: false,
                    },
                );
                Ok(TaskFailureOutcome::Exhausted)
            }
        }
    }

    async fn request_cancel(&self, run_id: Uuid, activity_id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();

        for (task_id, task) in tasks.iter_mut() {
            if task.definition.run_id != run_id || task.definition.activity_id != activity_id {
                continue;
            }

            match task.status {
                TaskStatus::Pending => {
                    task.status = TaskStatus::Cancelled;
                    let task_id = *task_id;
                    let error = ActivityError::cancelled("cancelled before start");
                    self.stage_report(
                        task,
                        task_id,
                        TaskOutcome::Failed {
                            error,
                            will_retry: false,
                        },
                    );
                    return Ok(true);
                }
                TaskStatus::Claimed => {
                    task.cancel_requested = true;
                    return Ok(true);
                }
                _ => {}
            }
        }

        Ok(false)
    }

    async fn find_timed_out_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimedOutTask>, StoreError> {
        let tasks = self.tasks.read();
        let mut timed_out = vec![];

        for (task_id, task) in tasks.iter() {
            let options = &task.definition.options;
            let timeout = match task.status {
                TaskStatus::Pending => {
                    let past_s2c = options.schedule_to_close_timeout.is_some_and(|t| {
                        now > task.scheduled_at + chrono::Duration::from_std(t).unwrap_or_default()
                    });
                    let past_s2s = task.attempt == 0
                        && now
                            > task.scheduled_at
                                + chrono::Duration::from_std(options.schedule_to_start_timeout)
                                    .unwrap_or_default();

                    if past_s2c {
                        Some(TimeoutKind::ScheduleToClose)
                    } else if past_s2s {
                        Some(TimeoutKind::ScheduleToStart)
                    } else {
                        None
                    }
                }
                TaskStatus::Claimed => {
                    let missed_heartbeat = options.heartbeat_timeout.is_some_and(|hb| {
                        task.last_heartbeat_at.is_some_and(|beat| {
                            now > beat + chrono::Duration::from_std(hb).unwrap_or_default()
                        })
                    });
                    let past_deadline = task.started_at.is_some_and(|started| {
                        now > started
                            + chrono::Duration::from_std(options.start_to_close_timeout)
                                .unwrap_or_default()
                    });

                    if missed_heartbeat {
                        Some(TimeoutKind::Heartbeat)
                    } else if past_deadline {
                        Some(TimeoutKind::StartToClose)
                    } else {
                        None
                    }
                }
                _ => None,
            };

            if let Some(timeout) = timeout {
                timed_out.push(TimedOutTask {
                    task_id: *task_id,
                    run_id: task.definition.run_id,
                    activity_id: task.definition.activity_id.clone(),
                    timeout,
                });
            }
        }

        Ok(timed_out)
    }

    async fn queue_depth(&self, queue: TaskQueue) -> Result<usize, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.definition.queue == queue)
            .count())
    }

    async fn take_completion_reports(
        &self,
        max: usize,
    ) -> Result<Vec<CompletionReport>, StoreError> {
        let mut reports = self.reports.lock();
        let take = max.min(reports.len());
        Ok(reports.drain(..take).collect())
    }

    async fn schedule_timer(
        &self,
        run_id: Uuid,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timers
            .write()
            .push((run_id, timer_id.to_string(), fire_at));
        Ok(())
    }

    async fn pop_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, StoreError> {
        let mut timers = self.timers.write();
        let mut due = vec![];

        timers.retain(|(run_id, timer_id, fire_at)| {
            if *fire_at <= now {
                due.push(DueTimer {
                    run_id: *run_id,
                    timer_id: timer_id.clone(),
                });
                false
            } else {
                true
            }
        });

        due.sort_by(|a, b| a.timer_id.cmp(&b.timer_id));
        Ok(due)
    }

    async fn push_signal(&self, run_id: Uuid, signal: Signal) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        if run.signals.len() >= SIGNAL_CHANNEL_CAPACITY {
            return Err(StoreError::ChannelFull(run.workflow_id.clone()));
        }

        run.signals.push(signal);
        Ok(())
    }

    async fn pending_signals(&self, run_id: Uuid) -> Result<Vec<Signal>, StoreError> {
        let runs = self.runs.read();
        let run = runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(run.signals.clone())
    }

    async fn mark_signals_processed(&self, run_id: Uuid, count: usize) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        run.signals = run.signals.split_off(count.min(run.signals.len()));
        Ok(())
    }

    async fn upsert_search_attributes(
        &self,
        _workflow_id: &str,
        run_id: Uuid,
        attributes: &AttributeMap,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        for (key, value) in attributes {
            run.attributes.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn get_search_attributes(&self, run_id: Uuid) -> Result<AttributeMap, StoreError> {
        let runs = self.runs.read();
        let run = runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(run.attributes.clone())
    }

    async fn query_executions(
        &self,
        filter: &AttributeFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let runs = self.runs.read();
        let mut records: Vec<_> = runs
            .iter()
            .filter(|(_, r)| filter.matches(&r.attributes))
            .map(|(id, r)| r.record(*id))
            .collect();

        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    async fn append_inbox(
        &self,
        principal: &str,
        workflow_id: &str,
        kind: InboxKind,
        payload: serde_json::Value,
    ) -> Result<InboxSignal, StoreError> {
        let mut inbox = self.inbox.write();
        let entries = inbox.entry(principal.to_string()).or_default();

        let sequence = entries.last().map(|e| e.sequence + 1).unwrap_or(1);
        let signal = InboxSignal {
            principal: principal.to_string(),
            sequence,
            workflow_id: workflow_id.to_string(),
            kind,
            payload,
            created_at: Utc::now(),
            read_at: None,
        };

        entries.push(signal.clone());
        Ok(signal)
    }

    async fn list_inbox(
        &self,
        principal: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<InboxSignal>, StoreError> {
        let inbox = self.inbox.read();
        Ok(inbox
            .get(principal)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn inbox_after(
        &self,
        principal: &str,
        after_sequence: i64,
    ) -> Result<Vec<InboxSignal>, StoreError> {
        let inbox = self.inbox.read();
        Ok(inbox
            .get(principal)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_inbox_read(&self, principal: &str, sequence: i64) -> Result<bool, StoreError> {
        let mut inbox = self.inbox.write();
        let Some(entries) = inbox.get_mut(principal) else {
            return Ok(false);
        };

        match entries.iter_mut().find(|e| e.sequence == sequence) {
            Some(entry) => {
                if entry.read_at.is_none() {
                    entry.read_at = Some(Utc::now());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn unread_inbox_count(&self, principal: &str) -> Result<u64, StoreError> {
        let inbox = self.inbox.read();
        Ok(inbox
            .get(principal)
            .map(|entries| entries.iter().filter(|e| e.read_at.is_none()).count() as u64)
            .unwrap_or(0))
    }

    async fn register_worker(&self, worker: WorkerInfo) -> Result<(), StoreError> {
        self.workers.write().insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn worker_heartbeat(
        &self,
        worker_id: &str,
        current_load: usize,
        accepting_tasks: bool,
    ) -> Result<(), StoreError> {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            worker.current_load = current_load as u32;
            worker.accepting_tasks = accepting_tasks;
            worker.last_heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.workers.write().remove(worker_id);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        Ok(self.workers.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::attributes::{keys, AttributeValue};
    use crate::workflow::ActivityOptions;
    use serde_json::json;
    use std::time::Duration;

    fn new_execution(workflow_id: &str) -> NewExecution {
        NewExecution {
            workflow_id: workflow_id.to_string(),
            run_id: Uuid::now_v7(),
            workflow_type: "document_processing".to_string(),
            tenant: "tenant-a".to_string(),
            input: json!({}),
            parent: None,
            run_timeout: None,
            id_reuse_policy: IdReusePolicy::AllowDuplicate,
        }
    }

    fn task_for(run_id: Uuid, activity_id: &str) -> TaskDefinition {
        TaskDefinition {
            workflow_id: "doc-d1".to_string(),
            run_id,
            scheduled_event_id: 1,
            activity_id: activity_id.to_string(),
            activity_type: "download_blob".to_string(),
            queue: TaskQueue::Storage,
            input: json!({}),
            options: ActivityOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_execution() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;

        store.create_execution(new).await.unwrap();

        let record = store.get_execution("doc-d1").await.unwrap();
        assert_eq!(record.run_id, run_id);
        assert_eq!(record.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_reject_duplicate_while_running() {
        let store = InMemoryExecutionStore::new();
        store.create_execution(new_execution("doc-d1")).await.unwrap();

        // A second start is rejected while the first run is live, even with
        // the permissive policy.
        let result = store.create_execution(new_execution("doc-d1")).await;
        assert!(matches!(result, Err(StoreError::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn test_id_reuse_policies() {
        let store = InMemoryExecutionStore::new();
        let first = new_execution("doc-d1");
        let first_run = first.run_id;
        store.create_execution(first).await.unwrap();
        store
            .update_run_status(first_run, WorkflowStatus::Completed, Some(json!({})), None)
            .await
            .unwrap();

        // Completed + AllowDuplicateFailedOnly → rejected
        let mut retry = new_execution("doc-d1");
        retry.id_reuse_policy = IdReusePolicy::AllowDuplicateFailedOnly;
        assert!(matches!(
            store.create_execution(retry).await,
            Err(StoreError::AlreadyStarted(_))
        ));

        // Completed + RejectDuplicate → rejected
        let mut reject = new_execution("doc-d1");
        reject.id_reuse_policy = IdReusePolicy::RejectDuplicate;
        assert!(matches!(
            store.create_execution(reject).await,
            Err(StoreError::AlreadyStarted(_))
        ));

        // Completed + AllowDuplicate → accepted
        store.create_execution(new_execution("doc-d1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_only_reuse_after_failure() {
        let store = InMemoryExecutionStore::new();
        let first = new_execution("doc-d1");
        let first_run = first.run_id;
        store.create_execution(first).await.unwrap();
        store
            .update_run_status(
                first_run,
                WorkflowStatus::Failed,
                None,
                Some(WorkflowError::new("boom")),
            )
            .await
            .unwrap();

        let mut retry = new_execution("doc-d1");
        retry.id_reuse_policy = IdReusePolicy::AllowDuplicateFailedOnly;
        store.create_execution(retry).await.unwrap();
    }

    #[tokio::test]
    async fn test_append_and_load_history() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let next = store
            .append_events(run_id, 0, vec![EventKind::WorkflowStarted { input: json!({}) }])
            .await
            .unwrap();
        assert_eq!(next, 1);

        let next = store
            .append_events(
                run_id,
                1,
                vec![EventKind::TimerFired {
                    timer_id: "t".to_string(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(next, 2);

        let history = store.load_history(run_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_id, 0);
        assert_eq!(history[1].event_id, 1);
    }

    #[tokio::test]
    async fn test_append_concurrency_conflict() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let result = store
            .append_events(run_id, 5, vec![EventKind::WorkflowStarted { input: json!({}) }])
            .await;

        assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn test_task_claim_and_complete() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let task_id = store
            .enqueue_task(task_for(run_id, "download"), Utc::now())
            .await
            .unwrap();
        assert_eq!(store.queue_depth(TaskQueue::Storage).await.unwrap(), 1);

        let claimed = store
            .claim_tasks(TaskQueue::Storage, "worker-1", &[], 5)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task_id, task_id);
        assert_eq!(claimed[0].attempt, 1);

        assert!(store.complete_task(task_id, json!({"ok": true})).await.unwrap());
        // Duplicate completion reports are dropped.
        assert!(!store.complete_task(task_id, json!({"ok": true})).await.unwrap());

        let reports = store.take_completion_reports(10).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].outcome, TaskOutcome::Started { .. }));
        assert!(matches!(reports[1].outcome, TaskOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_delayed_task_not_claimable() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        store
            .enqueue_task(
                task_for(run_id, "later"),
                Utc::now() + chrono::Duration::seconds(60),
            )
            .await
            .unwrap();

        let claimed = store
            .claim_tasks(TaskQueue::Storage, "worker-1", &[], 5)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_fail_task_retries_then_exhausts() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let mut task = task_for(run_id, "download");
        task.options.retry_policy = crate::RetryPolicy::fixed(Duration::ZERO, 2);
        let task_id = store.enqueue_task(task, Utc::now()).await.unwrap();

        store
            .claim_tasks(TaskQueue::Storage, "w", &[], 1)
            .await
            .unwrap();
        let outcome = store
            .fail_task(task_id, &ActivityError::retryable("503"))
            .await
            .unwrap();
        assert!(matches!(outcome, TaskFailureOutcome::WillRetry { next_attempt: 2, .. }));

        store
            .claim_tasks(TaskQueue::Storage, "w", &[], 1)
            .await
            .unwrap();
        let outcome = store
            .fail_task(task_id, &ActivityError::retryable("503"))
            .await
            .unwrap();
        assert!(matches!(outcome, TaskFailureOutcome::Exhausted));

        let reports = store.take_completion_reports(10).await.unwrap();
        let failures: Vec<_> = reports
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Failed { .. }))
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(matches!(
            failures[0].outcome,
            TaskOutcome::Failed { will_retry: true, .. }
        ));
        assert!(matches!(
            failures[1].outcome,
            TaskOutcome::Failed { will_retry: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_non_retryable_error_exhausts_immediately() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let task_id = store
            .enqueue_task(task_for(run_id, "download"), Utc::now())
            .await
            .unwrap();
        store
            .claim_tasks(TaskQueue::Storage, "w", &[], 1)
            .await
            .unwrap();

        let outcome = store
            .fail_task(task_id, &ActivityError::non_retryable("bad path"))
            .await
            .unwrap();
        assert!(matches!(outcome, TaskFailureOutcome::Exhausted));
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        store
            .enqueue_task(task_for(run_id, "download"), Utc::now())
            .await
            .unwrap();

        assert!(store.request_cancel(run_id, "download").await.unwrap());

        let reports = store.take_completion_reports(10).await.unwrap();
        assert_eq!(reports.len(), 1);
        match &reports[0].outcome {
            TaskOutcome::Failed { error, will_retry } => {
                assert!(error.is_cancelled());
                assert!(!will_retry);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_running_task_sets_flag() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let task_id = store
            .enqueue_task(task_for(run_id, "download"), Utc::now())
            .await
            .unwrap();
        store
            .claim_tasks(TaskQueue::Storage, "w", &[], 1)
            .await
            .unwrap();

        assert!(store.request_cancel(run_id, "download").await.unwrap());

        let response = store.record_heartbeat(task_id, "w", None).await.unwrap();
        assert!(response.accepted);
        assert!(response.cancel_requested);
    }

    #[tokio::test]
    async fn test_schedule_to_start_timeout_detected() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let mut task = task_for(run_id, "download");
        task.options.schedule_to_start_timeout = Duration::from_secs(60);
        store.enqueue_task(task, Utc::now()).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        let timed_out = store.find_timed_out_tasks(later).await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].timeout, TimeoutKind::ScheduleToStart);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_detected_before_deadline() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let mut task = task_for(run_id, "embed");
        task.options.heartbeat_timeout = Some(Duration::from_secs(10));
        store.enqueue_task(task, Utc::now()).await.unwrap();
        store
            .claim_tasks(TaskQueue::Storage, "w", &[], 1)
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(30);
        let timed_out = store.find_timed_out_tasks(later).await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].timeout, TimeoutKind::Heartbeat);
    }

    #[tokio::test]
    async fn test_signal_channel_bound() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        for i in 0..SIGNAL_CHANNEL_CAPACITY {
            store
                .push_signal(run_id, Signal::new("s", json!({"i": i})))
                .await
                .unwrap();
        }

        let result = store.push_signal(run_id, Signal::new("s", json!({}))).await;
        assert!(matches!(result, Err(StoreError::ChannelFull(_))));
    }

    #[tokio::test]
    async fn test_signal_fifo_order() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        for i in 0..3 {
            store
                .push_signal(run_id, Signal::new("s", json!({"i": i})))
                .await
                .unwrap();
        }

        let signals = store.pending_signals(run_id).await.unwrap();
        let order: Vec<i64> = signals
            .iter()
            .map(|s| s.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);

        store.mark_signals_processed(run_id, 2).await.unwrap();
        let signals = store.pending_signals(run_id).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].payload["i"], 2);
    }

    #[tokio::test]
    async fn test_search_attribute_query() {
        let store = InMemoryExecutionStore::new();
        let new = new_execution("doc-d1");
        let run_id = new.run_id;
        store.create_execution(new).await.unwrap();

        let mut attrs = AttributeMap::new();
        attrs.insert(keys::STATUS.into(), AttributeValue::text("pending"));
        attrs.insert(keys::QUEUE.into(), AttributeValue::text("document-review"));
        store
            .upsert_search_attributes("doc-d1", run_id, &attrs)
            .await
            .unwrap();

        let filter = AttributeFilter::new()
            .eq(keys::STATUS, "pending")
            .eq(keys::QUEUE, "document-review");
        let hits = store.query_executions(&filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].workflow_id, "doc-d1");

        // Upsert merges rather than replaces.
        let mut escalate = AttributeMap::new();
        escalate.insert(keys::PRIORITY.into(), AttributeValue::text("high"));
        store
            .upsert_search_attributes("doc-d1", run_id, &escalate)
            .await
            .unwrap();

        let attrs = store.get_search_attributes(run_id).await.unwrap();
        assert_eq!(attrs.get(keys::STATUS), Some(&AttributeValue::text("pending")));
        assert_eq!(attrs.get(keys::PRIORITY), Some(&AttributeValue::text("high")));
    }

    #[tokio::test]
    async fn test_inbox_sequence_monotonic() {
        let store = InMemoryExecutionStore::new();

        for i in 0..3 {
            let signal = store
                .append_inbox("u1", "doc-d1", InboxKind::Progress, json!({"i": i}))
                .await
                .unwrap();
            assert_eq!(signal.sequence, i + 1);
        }

        assert_eq!(store.unread_inbox_count("u1").await.unwrap(), 3);
        assert!(store.mark_inbox_read("u1", 2).await.unwrap());
        assert_eq!(store.unread_inbox_count("u1").await.unwrap(), 2);

        let tail = store.inbox_after("u1", 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 2);

        // Newest first when listing.
        let page = store.list_inbox("u1", 2, 0).await.unwrap();
        assert_eq!(page[0].sequence, 3);
    }

    #[tokio::test]
    async fn test_timers_pop_once() {
        let store = InMemoryExecutionStore::new();
        let run_id = Uuid::now_v7();

        store
            .schedule_timer(run_id, "review-deadline", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        store
            .schedule_timer(run_id, "later", Utc::now() + chrono::Duration::seconds(600))
            .await
            .unwrap();

        let due = store.pop_due_timers(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].timer_id, "review-deadline");

        let due = store.pop_due_timers(Utc::now()).await.unwrap();
        assert!(due.is_empty());
    }
}
