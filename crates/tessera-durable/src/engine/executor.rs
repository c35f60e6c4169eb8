//! Workflow executor with replay support
//!
//! The executor drives workflow state machines:
//! - starting new runs (enforcing id-reuse policies)
//! - replaying history to rebuild state and reconcile already-recorded
//!   decisions against fresh ones
//! - persisting fresh decisions as events before acting on them
//! - draining signal channels in FIFO order
//! - routing child-workflow results back to parents by run reference
//!
//! Replay determinism is the core invariant: a definition replayed over the
//! same history must emit the same decision sequence. The executor matches
//! replayed decisions against their recorded anchor events (ActivityScheduled,
//! TimerStarted, ...) and only acts on the unmatched tail.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    ExecutionRecord, ExecutionStore, IdReusePolicy, NewExecution, ParentRef, StoreError,
    TaskDefinition, TaskOutcome, WorkflowStatus,
};
use crate::router::{QueueRouter, TaskQueue};
use crate::workflow::attributes::{AttributeFilter, AttributeMap};
use crate::workflow::{
    Decision, EventKind, HistoryEvent, Signal, Workflow, WorkflowContext, WorkflowError,
};

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};

/// Maximum workflow input payload (256 KiB serialized).
pub const MAX_INPUT_BYTES: usize = 256 * 1024;

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// History cap; at this size a run must complete, fail or
    /// continue-as-new. Exceeding it by more than one event fails the run.
    pub max_history_events: usize,

    /// Consecutive processing failures before a run is declared
    /// nondeterministic and failed.
    pub poison_threshold: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_history_events: 50_000,
            poison_threshold: 3,
        }
    }
}

/// Options for starting a workflow.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub tenant: String,
    pub id_reuse_policy: IdReusePolicy,
    pub run_timeout: Option<Duration>,
}

impl StartOptions {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id_reuse_policy: IdReusePolicy::default(),
            run_timeout: None,
        }
    }

    pub fn with_id_reuse_policy(mut self, policy: IdReusePolicy) -> Self {
        self.id_reuse_policy = policy;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Operation on a closed run
    #[error("workflow {0} is closed")]
    WorkflowClosed(String),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Replay produced a history the definition cannot explain
    #[error("nondeterminism detected: {0}")]
    NonDeterminism(String),

    /// History grew past the cap without closing
    #[error("workflow {workflow_id} exceeded history limit ({events} > {limit})")]
    HistoryLimitExceeded {
        workflow_id: String,
        events: usize,
        limit: usize,
    },

    /// Input payload over the size cap
    #[error("workflow input too large: {0} bytes")]
    InputTooLarge(usize),

    /// Unknown query name
    #[error("unknown query: {0}")]
    UnknownQuery(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Snapshot returned by describe.
#[derive(Debug, Clone)]
pub struct DescribeResult {
    pub record: ExecutionRecord,
    pub search_attributes: AttributeMap,
    /// Activity ids scheduled but without a final outcome yet.
    pub pending_activities: Vec<String>,
}

/// Counts of decision anchor events already present in history, used to
/// separate replayed decisions from fresh ones.
#[derive(Default)]
struct RecordedAnchors {
    scheduled: HashMap<String, usize>,
    timers: HashMap<String, usize>,
    upserts: usize,
    children: HashMap<String, usize>,
    terminal: bool,
}

impl RecordedAnchors {
    fn scan(history: &[HistoryEvent]) -> Self {
        let mut anchors = Self::default();
        for event in history {
            match &event.kind {
                EventKind::ActivityScheduled { activity_id, .. } => {
                    *anchors.scheduled.entry(activity_id.clone()).or_default() += 1;
                }
                EventKind::TimerStarted { timer_id, .. } => {
                    *anchors.timers.entry(timer_id.clone()).or_default() += 1;
                }
                EventKind::SearchAttributesUpserted { .. } => anchors.upserts += 1,
                EventKind::ChildWorkflowStarted {
                    child_workflow_id, ..
                } => {
                    *anchors.children.entry(child_workflow_id.clone()).or_default() += 1;
                }
                kind if kind.is_terminal() => anchors.terminal = true,
                _ => {}
            }
        }
        anchors
    }

    /// Consume the anchor for a replayed decision; returns true when the
    /// decision was already recorded (and must not be re-executed).
    fn consume(&mut self, decision: &Decision) -> bool {
        let counter = match decision {
            Decision::ScheduleActivity { activity_id, .. } => self.scheduled.get_mut(activity_id),
            Decision::StartTimer { timer_id, .. } => self.timers.get_mut(timer_id),
            Decision::UpsertSearchAttributes { .. } => {
                if self.upserts > 0 {
                    self.upserts -= 1;
                    return true;
                }
                return false;
            }
            Decision::StartChildWorkflow {
                child_workflow_id, ..
            } => self.children.get_mut(child_workflow_id),
            Decision::CompleteWorkflow { .. }
            | Decision::FailWorkflow { .. }
            | Decision::ContinueAsNew { .. } => return self.terminal,
            // Cancellation has no anchor event; re-requesting is idempotent.
            Decision::CancelActivity { .. } => return false,
        };

        match counter {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Workflow executor
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryExecutionStore::new());
/// let mut executor = WorkflowExecutor::new(store);
/// executor.register::<DocumentProcessingWorkflow>();
/// let executor = Arc::new(executor);
///
/// let run_id = executor
///     .start_workflow::<DocumentProcessingWorkflow>("doc-d1", input, options)
///     .await?;
/// ```
pub struct WorkflowExecutor {
    store: Arc<dyn ExecutionStore>,
    router: QueueRouter,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
    /// Consecutive processing failures per run (poison detection).
    poison: DashMap<Uuid, u32>,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    pub fn with_config(store: Arc<dyn ExecutionStore>, config: ExecutorConfig) -> Self {
        Self {
            router: QueueRouter::new(Arc::clone(&store)),
            store,
            registry: WorkflowRegistry::new(),
            config,
            poison: DashMap::new(),
        }
    }

    /// Register a workflow type.
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn router(&self) -> &QueueRouter {
        &self.router
    }

    // =========================================================================
    // Public Contract
    // =========================================================================

    /// Start a workflow of a statically known type.
    pub async fn start_workflow<W: Workflow>(
        &self,
        workflow_id: impl Into<String>,
        input: W::Input,
        options: StartOptions,
    ) -> Result<Uuid, ExecutorError> {
        let input = serde_json::to_value(&input)?;
        self.start_workflow_by_type(workflow_id.into(), W::TYPE, input, options)
            .await
    }

    /// Start a workflow by type name (ingress path).
    #[instrument(skip(self, input, options), fields(tenant = %options.tenant))]
    pub async fn start_workflow_by_type(
        &self,
        workflow_id: String,
        workflow_type: &str,
        input: serde_json::Value,
        options: StartOptions,
    ) -> Result<Uuid, ExecutorError> {
        let input_len = serde_json::to_vec(&input)?.len();
        if input_len > MAX_INPUT_BYTES {
            return Err(ExecutorError::InputTooLarge(input_len));
        }

        // Validate type and input before anything is persisted.
        self.registry.create(workflow_type, input.clone())?;

        let run_id = Uuid::now_v7();
        self.store
            .create_execution(NewExecution {
                workflow_id: workflow_id.clone(),
                run_id,
                workflow_type: workflow_type.to_string(),
                tenant: options.tenant,
                input: input.clone(),
                parent: None,
                run_timeout: options.run_timeout,
                id_reuse_policy: options.id_reuse_policy,
            })
            .await?;

        self.store
            .append_events(run_id, 0, vec![EventKind::WorkflowStarted { input }])
            .await?;

        info!(%workflow_id, %run_id, workflow_type, "workflow started");

        self.process_run(run_id).await?;
        Ok(run_id)
    }

    /// Deliver a signal to a workflow's channel and process it.
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        signal_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), ExecutorError> {
        let record = self.resolve(workflow_id, run_id).await?;

        if record.status.is_terminal() {
            return Err(ExecutorError::WorkflowClosed(workflow_id.to_string()));
        }

        self.store
            .push_signal(record.run_id, Signal::new(signal_name, payload))
            .await?;

        debug!(%workflow_id, run_id = %record.run_id, signal_name, "signal enqueued");

        self.process_run(record.run_id).await
    }

    /// Pure read of replayed in-workflow state. Never appends to history.
    pub async fn query_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        query_name: &str,
    ) -> Result<serde_json::Value, ExecutorError> {
        let record = self.resolve(workflow_id, run_id).await?;

        match query_name {
            "get_input" => Ok(record.input),
            "get_status" => Ok(serde_json::to_value(record.status)?),
            other => {
                let history = self.store.load_history(record.run_id).await?;
                let mut workflow = self
                    .registry
                    .create(&record.workflow_type, record.input.clone())?;

                // Replay for state only; decisions are discarded.
                for event in &history {
                    let ctx = self.context(&record, event, history.len());
                    let _ = Self::apply_event(workflow.as_mut(), &ctx, &event.kind);
                }

                workflow
                    .query(other)
                    .ok_or_else(|| ExecutorError::UnknownQuery(other.to_string()))
            }
        }
    }

    /// Describe an execution: status, attributes and open activities.
    pub async fn describe_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<DescribeResult, ExecutorError> {
        let record = self.resolve(workflow_id, run_id).await?;
        let history = self.store.load_history(record.run_id).await?;
        let search_attributes = self.store.get_search_attributes(record.run_id).await?;

        let pending_activities = history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ActivityScheduled { activity_id, .. } => Some(activity_id.clone()),
                _ => None,
            })
            .filter(|id| Self::activity_open(&history, id))
            .collect();

        Ok(DescribeResult {
            record,
            search_attributes,
            pending_activities,
        })
    }

    /// Terminate a run; its history is preserved and never replayed again.
    #[instrument(skip(self))]
    pub async fn terminate_workflow(
        &self,
        workflow_id: &str,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        let record = self.resolve(workflow_id, None).await?;

        if record.status.is_terminal() {
            return Err(ExecutorError::WorkflowClosed(workflow_id.to_string()));
        }

        self.append_at_end(
            record.run_id,
            vec![EventKind::WorkflowTerminated {
                reason: reason.to_string(),
            }],
        )
        .await?;
        self.store
            .update_run_status(record.run_id, WorkflowStatus::Terminated, None, None)
            .await?;

        warn!(%workflow_id, run_id = %record.run_id, reason, "workflow terminated");

        // A terminated child still resolves its parent's await.
        let mut queue = VecDeque::new();
        self.notify_parent(
            &record,
            Err(WorkflowError::new(format!("terminated: {reason}")).with_code("Terminated")),
            &mut queue,
        )
        .await?;
        self.drain(queue).await
    }

    /// Executions matching a search-attribute predicate.
    pub async fn list_workflows(
        &self,
        filter: &AttributeFilter,
    ) -> Result<Vec<ExecutionRecord>, ExecutorError> {
        Ok(self.store.query_executions(filter).await?)
    }

    // =========================================================================
    // Engine-Runtime Entry Points
    // =========================================================================

    /// Apply staged task attempt outcomes to workflow histories.
    ///
    /// Idempotent per `(run_id, scheduled_event_id, attempt)`: outcomes for
    /// activities that already have a final event are dropped.
    pub async fn pump_completions(&self, max: usize) -> Result<usize, ExecutorError> {
        let reports = self.store.take_completion_reports(max).await?;
        let mut applied = 0;

        for report in reports {
            let record = match self.store.get_run(report.run_id).await {
                Ok(record) => record,
                Err(StoreError::RunNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if record.status.is_terminal() {
                continue;
            }

            let history = self.store.load_history(report.run_id).await?;
            if !Self::activity_open(&history, &report.activity_id) {
                debug!(
                    run_id = %report.run_id,
                    activity_id = %report.activity_id,
                    "dropping duplicate attempt outcome"
                );
                continue;
            }

            let (kind, advances) = match report.outcome {
                TaskOutcome::Started { worker_id } => (
                    EventKind::ActivityStarted {
                        activity_id: report.activity_id.clone(),
                        attempt: report.attempt,
                        worker_id,
                    },
                    false,
                ),
                TaskOutcome::Completed { result } => (
                    EventKind::ActivityCompleted {
                        activity_id: report.activity_id.clone(),
                        result,
                    },
                    true,
                ),
                TaskOutcome::Failed { error, will_retry } => (
                    EventKind::ActivityFailed {
                        activity_id: report.activity_id.clone(),
                        error,
                        will_retry,
                    },
                    !will_retry,
                ),
                TaskOutcome::TimedOut { timeout, will_retry } => (
                    EventKind::ActivityTimedOut {
                        activity_id: report.activity_id.clone(),
                        timeout,
                        will_retry,
                    },
                    !will_retry,
                ),
            };

            self.append_at_end(report.run_id, vec![kind]).await?;
            applied += 1;

            if advances {
                self.process_run(report.run_id).await?;
            }
        }

        Ok(applied)
    }

    /// Record a timer firing and advance the workflow.
    pub async fn on_timer_fired(
        &self,
        run_id: Uuid,
        timer_id: &str,
    ) -> Result<(), ExecutorError> {
        let record = self.store.get_run(run_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        self.append_at_end(
            run_id,
            vec![EventKind::TimerFired {
                timer_id: timer_id.to_string(),
            }],
        )
        .await?;

        self.process_run(run_id).await
    }

    /// Fail a run that exceeded its run timeout.
    pub async fn fail_run_timed_out(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let record = self.store.get_run(run_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        let error = WorkflowError::new("run timeout exceeded").with_code("TimedOut");
        self.append_at_end(
            run_id,
            vec![EventKind::WorkflowFailed {
                error: error.clone(),
            }],
        )
        .await?;
        self.store
            .update_run_status(run_id, WorkflowStatus::TimedOut, None, Some(error.clone()))
            .await?;

        warn!(workflow_id = %record.workflow_id, %run_id, "run timed out");

        let mut queue = VecDeque::new();
        self.notify_parent(&record, Err(error), &mut queue).await?;
        self.drain(queue).await
    }

    /// Process a run: replay history, act on fresh decisions, drain signals,
    /// and cascade to children/parents as needed.
    pub async fn process_run(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let mut queue = VecDeque::from([run_id]);
        let mut conflict_retries: HashMap<Uuid, u32> = HashMap::new();

        while let Some(next) = queue.pop_front() {
            match self.process_single(next, &mut queue).await {
                Ok(()) => {
                    self.poison.remove(&next);
                }
                // Losing an append race is not nondeterminism; reprocess
                // against the longer history.
                Err(ExecutorError::Store(StoreError::ConcurrencyConflict { .. }))
                    if *conflict_retries.get(&next).unwrap_or(&0) < 5 =>
                {
                    *conflict_retries.entry(next).or_default() += 1;
                    queue.push_back(next);
                }
                Err(e) => {
                    let failures = {
                        let mut entry = self.poison.entry(next).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    error!(run_id = %next, failures, "processing failed: {e}");

                    if failures >= self.config.poison_threshold {
                        self.poison.remove(&next);
                        self.fail_poisoned(next).await?;
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Append events at the current end of a run's history, retrying when a
    /// concurrent appender wins the race.
    async fn append_at_end(
        &self,
        run_id: Uuid,
        events: Vec<EventKind>,
    ) -> Result<i64, ExecutorError> {
        let mut attempts = 0;
        loop {
            let history = self.store.load_history(run_id).await?;
            match self
                .store
                .append_events(run_id, history.len() as i64, events.clone())
                .await
            {
                Ok(next) => return Ok(next),
                Err(StoreError::ConcurrencyConflict { .. }) if attempts < 3 => {
                    attempts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    async fn resolve(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<ExecutionRecord, ExecutorError> {
        let result = match run_id {
            Some(run_id) => self.store.get_run(run_id).await,
            None => self.store.get_execution(workflow_id).await,
        };

        result.map_err(|e| match e {
            StoreError::WorkflowNotFound(_) | StoreError::RunNotFound(_) => {
                ExecutorError::WorkflowNotFound(workflow_id.to_string())
            }
            other => other.into(),
        })
    }

    fn context(
        &self,
        record: &ExecutionRecord,
        event: &HistoryEvent,
        history_len: usize,
    ) -> WorkflowContext {
        WorkflowContext::new(
            record.workflow_id.clone(),
            record.run_id,
            record.tenant.clone(),
            event.timestamp,
            history_len,
        )
    }

    /// Whether an activity is scheduled without a final outcome.
    fn activity_open(history: &[HistoryEvent], activity_id: &str) -> bool {
        let mut scheduled = false;
        for event in history {
            match &event.kind {
                EventKind::ActivityScheduled { activity_id: id, .. } if id == activity_id => {
                    scheduled = true;
                }
                EventKind::ActivityCompleted { activity_id: id, .. } if id == activity_id => {
                    return false;
                }
                EventKind::ActivityFailed {
                    activity_id: id,
                    will_retry: false,
                    ..
                } if id == activity_id => return false,
                EventKind::ActivityTimedOut {
                    activity_id: id,
                    will_retry: false,
                    ..
                } if id == activity_id => return false,
                _ => {}
            }
        }
        scheduled
    }

    /// Dispatch a history event to the matching workflow hook.
    fn apply_event(
        workflow: &mut dyn AnyWorkflow,
        ctx: &WorkflowContext,
        kind: &EventKind,
    ) -> Vec<Decision> {
        match kind {
            EventKind::WorkflowStarted { .. } => workflow.on_start(ctx),

            EventKind::ActivityCompleted {
                activity_id,
                result,
            } => workflow.on_activity_completed(ctx, activity_id, result.clone()),

            EventKind::ActivityFailed {
                activity_id,
                error,
                will_retry,
            } => {
                if *will_retry {
                    vec![]
                } else {
                    workflow.on_activity_failed(ctx, activity_id, error)
                }
            }

            EventKind::ActivityTimedOut {
                activity_id,
                timeout,
                will_retry,
            } => {
                if *will_retry {
                    vec![]
                } else {
                    let error = crate::activity::ActivityError::non_retryable(format!(
                        "activity timed out: {timeout:?}"
                    ))
                    .with_type(timeout_error_type(*timeout));
                    workflow.on_activity_failed(ctx, activity_id, &error)
                }
            }

            EventKind::TimerFired { timer_id } => workflow.on_timer_fired(ctx, timer_id),

            EventKind::SignalReceived { signal } => workflow.on_signal(ctx, signal),

            EventKind::ChildWorkflowCompleted {
                child_workflow_id,
                result,
            } => workflow.on_child_completed(ctx, child_workflow_id, result.clone()),

            EventKind::ChildWorkflowFailed {
                child_workflow_id,
                error,
            } => workflow.on_child_failed(ctx, child_workflow_id, error),

            // Informational during replay; decisions were anchored elsewhere.
            EventKind::WorkflowCompleted { .. }
            | EventKind::WorkflowFailed { .. }
            | EventKind::WorkflowTerminated { .. }
            | EventKind::ContinueAsNew { .. }
            | EventKind::ActivityScheduled { .. }
            | EventKind::ActivityStarted { .. }
            | EventKind::TimerStarted { .. }
            | EventKind::SearchAttributesUpserted { .. }
            | EventKind::ChildWorkflowStarted { .. } => vec![],
        }
    }

    async fn process_single(
        &self,
        run_id: Uuid,
        queue: &mut VecDeque<Uuid>,
    ) -> Result<(), ExecutorError> {
        let record = self.store.get_run(run_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        let history = self.store.load_history(run_id).await?;
        if history.is_empty() {
            return Err(ExecutorError::WorkflowNotFound(record.workflow_id));
        }
        if !matches!(history[0].kind, EventKind::WorkflowStarted { .. }) {
            return Err(ExecutorError::NonDeterminism(
                "first event must be WorkflowStarted".to_string(),
            ));
        }

        // Past the cap the run must close this pass; more than one event of
        // grace is a hard failure.
        let limit = self.config.max_history_events;
        if history.len() > limit + 1 {
            let error = ExecutorError::HistoryLimitExceeded {
                workflow_id: record.workflow_id.clone(),
                events: history.len(),
                limit,
            };
            self.close_run(
                &record,
                history.len() as i64,
                Err(WorkflowError::new(error.to_string()).with_code("HistoryLimitExceeded")),
                queue,
            )
            .await?;
            return Ok(());
        }

        let mut workflow = self
            .registry
            .create(&record.workflow_type, record.input.clone())?;

        // Replay, reconciling decisions against their recorded anchors; the
        // unmatched tail is fresh work.
        let mut anchors = RecordedAnchors::scan(&history);
        let mut fresh = vec![];
        for event in &history {
            let ctx = self.context(&record, event, history.len());
            for decision in Self::apply_event(workflow.as_mut(), &ctx, &event.kind) {
                if !anchors.consume(&decision) {
                    fresh.push(decision);
                }
            }
        }

        debug!(%run_id, events = history.len(), fresh = fresh.len(), "replayed history");

        let mut next_event_id = history.len() as i64;
        let closed = self
            .execute_decisions(&record, &mut next_event_id, fresh, queue)
            .await?;
        if closed {
            return Ok(());
        }

        // Drain pending signals in delivery order.
        let signals = self.store.pending_signals(run_id).await?;
        let mut consumed = 0;
        let mut closed = false;

        for signal in signals {
            let event_kind = EventKind::SignalReceived {
                signal: signal.clone(),
            };
            next_event_id = self
                .store
                .append_events(run_id, next_event_id, vec![event_kind])
                .await?;
            consumed += 1;

            let ctx = WorkflowContext::new(
                record.workflow_id.clone(),
                record.run_id,
                record.tenant.clone(),
                Utc::now(),
                next_event_id as usize,
            );
            let decisions = workflow.on_signal(&ctx, &signal);
            closed = self
                .execute_decisions(&record, &mut next_event_id, decisions, queue)
                .await?;
            if closed {
                break;
            }
        }

        if consumed > 0 {
            self.store.mark_signals_processed(run_id, consumed).await?;
        }
        if closed {
            return Ok(());
        }

        // Defensive close for definitions that mark themselves finished
        // without issuing a terminal decision.
        if workflow.is_finished() {
            let outcome = match workflow.error() {
                Some(error) => Err(error),
                None => Ok(workflow.result_json().unwrap_or(serde_json::Value::Null)),
            };
            self.close_run(&record, next_event_id, outcome, queue).await?;
        }

        Ok(())
    }

    /// Persist and act on fresh decisions. Returns true when the run closed.
    async fn execute_decisions(
        &self,
        record: &ExecutionRecord,
        next_event_id: &mut i64,
        decisions: Vec<Decision>,
        queue: &mut VecDeque<Uuid>,
    ) -> Result<bool, ExecutorError> {
        let run_id = record.run_id;

        for decision in decisions {
            match decision {
                Decision::ScheduleActivity {
                    activity_id,
                    activity_type,
                    queue: target,
                    input,
                    options,
                } => {
                    let target = target.unwrap_or_else(|| TaskQueue::default_for(&activity_type));
                    debug!(%run_id, %activity_id, %activity_type, queue = %target, "scheduling activity");

                    let scheduled_event_id = *next_event_id;
                    *next_event_id = self
                        .store
                        .append_events(
                            run_id,
                            *next_event_id,
                            vec![EventKind::ActivityScheduled {
                                activity_id: activity_id.clone(),
                                activity_type: activity_type.clone(),
                                queue: target,
                                input: input.clone(),
                                options: options.clone(),
                            }],
                        )
                        .await?;

                    self.router
                        .admit(
                            TaskDefinition {
                                workflow_id: record.workflow_id.clone(),
                                run_id,
                                scheduled_event_id,
                                activity_id,
                                activity_type,
                                queue: target,
                                input,
                                options,
                            },
                            Utc::now(),
                        )
                        .await?;
                }

                Decision::StartTimer { timer_id, duration } => {
                    let fire_at = Utc::now()
                        + chrono::Duration::from_std(duration).unwrap_or_default();
                    debug!(%run_id, %timer_id, ?duration, "starting timer");

                    *next_event_id = self
                        .store
                        .append_events(
                            run_id,
                            *next_event_id,
                            vec![EventKind::TimerStarted {
                                timer_id: timer_id.clone(),
                                fire_at,
                            }],
                        )
                        .await?;

                    self.store.schedule_timer(run_id, &timer_id, fire_at).await?;
                }

                Decision::CancelActivity { activity_id } => {
                    debug!(%run_id, %activity_id, "requesting activity cancellation");
                    self.store.request_cancel(run_id, &activity_id).await?;
                }

                Decision::UpsertSearchAttributes { attributes } => {
                    *next_event_id = self
                        .store
                        .append_events(
                            run_id,
                            *next_event_id,
                            vec![EventKind::SearchAttributesUpserted {
                                attributes: attributes.clone(),
                            }],
                        )
                        .await?;

                    self.store
                        .upsert_search_attributes(&record.workflow_id, run_id, &attributes)
                        .await?;
                }

                Decision::StartChildWorkflow {
                    child_workflow_id,
                    workflow_type,
                    input,
                } => {
                    debug!(%run_id, %child_workflow_id, %workflow_type, "starting child workflow");

                    *next_event_id = self
                        .store
                        .append_events(
                            run_id,
                            *next_event_id,
                            vec![EventKind::ChildWorkflowStarted {
                                child_workflow_id: child_workflow_id.clone(),
                                workflow_type: workflow_type.clone(),
                            }],
                        )
                        .await?;

                    let child_run_id = Uuid::now_v7();
                    let created = self
                        .store
                        .create_execution(NewExecution {
                            workflow_id: child_workflow_id.clone(),
                            run_id: child_run_id,
                            workflow_type: workflow_type.clone(),
                            tenant: record.tenant.clone(),
                            input: input.clone(),
                            parent: Some(ParentRef {
                                workflow_id: record.workflow_id.clone(),
                                run_id,
                            }),
                            run_timeout: None,
                            id_reuse_policy: IdReusePolicy::AllowDuplicate,
                        })
                        .await;

                    match created {
                        Ok(()) => {
                            self.store
                                .append_events(
                                    child_run_id,
                                    0,
                                    vec![EventKind::WorkflowStarted { input }],
                                )
                                .await?;
                            queue.push_back(child_run_id);
                        }
                        Err(StoreError::AlreadyStarted(_)) => {
                            // Surfaced to the parent as a child failure.
                            *next_event_id = self
                                .store
                                .append_events(
                                    run_id,
                                    *next_event_id,
                                    vec![EventKind::ChildWorkflowFailed {
                                        child_workflow_id: child_workflow_id.clone(),
                                        error: WorkflowError::new("child already started")
                                            .with_code("AlreadyStarted"),
                                    }],
                                )
                                .await?;
                            queue.push_back(run_id);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                Decision::CompleteWorkflow { result } => {
                    self.close_run(record, *next_event_id, Ok(result), queue).await?;
                    return Ok(true);
                }

                Decision::FailWorkflow { error } => {
                    self.close_run(record, *next_event_id, Err(error), queue).await?;
                    return Ok(true);
                }

                Decision::ContinueAsNew { input } => {
                    let new_run_id = Uuid::now_v7();
                    info!(%run_id, %new_run_id, "continuing as new");

                    self.store
                        .append_events(
                            run_id,
                            *next_event_id,
                            vec![EventKind::ContinueAsNew {
                                input: input.clone(),
                                new_run_id,
                            }],
                        )
                        .await?;
                    self.store
                        .update_run_status(run_id, WorkflowStatus::ContinuedAsNew, None, None)
                        .await?;

                    self.store
                        .create_execution(NewExecution {
                            workflow_id: record.workflow_id.clone(),
                            run_id: new_run_id,
                            workflow_type: record.workflow_type.clone(),
                            tenant: record.tenant.clone(),
                            input: input.clone(),
                            parent: record.parent.clone(),
                            run_timeout: record.run_timeout,
                            id_reuse_policy: IdReusePolicy::AllowDuplicate,
                        })
                        .await?;
                    self.store
                        .append_events(new_run_id, 0, vec![EventKind::WorkflowStarted { input }])
                        .await?;

                    queue.push_back(new_run_id);
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Close a run with a result or error, then wake the parent if any.
    async fn close_run(
        &self,
        record: &ExecutionRecord,
        next_event_id: i64,
        outcome: Result<serde_json::Value, WorkflowError>,
        queue: &mut VecDeque<Uuid>,
    ) -> Result<(), ExecutorError> {
        match &outcome {
            Ok(result) => {
                info!(workflow_id = %record.workflow_id, run_id = %record.run_id, "workflow completed");
                self.store
                    .append_events(
                        record.run_id,
                        next_event_id,
                        vec![EventKind::WorkflowCompleted {
                            result: result.clone(),
                        }],
                    )
                    .await?;
                self.store
                    .update_run_status(
                        record.run_id,
                        WorkflowStatus::Completed,
                        Some(result.clone()),
                        None,
                    )
                    .await?;
            }
            Err(error) => {
                error!(
                    workflow_id = %record.workflow_id,
                    run_id = %record.run_id,
                    error = %error.message,
                    "workflow failed"
                );
                self.store
                    .append_events(
                        record.run_id,
                        next_event_id,
                        vec![EventKind::WorkflowFailed {
                            error: error.clone(),
                        }],
                    )
                    .await?;
                self.store
                    .update_run_status(
                        record.run_id,
                        WorkflowStatus::Failed,
                        None,
                        Some(error.clone()),
                    )
                    .await?;
            }
        }

        self.notify_parent(record, outcome, queue).await
    }

    /// Route a child's terminal outcome to its parent run.
    async fn notify_parent(
        &self,
        record: &ExecutionRecord,
        outcome: Result<serde_json::Value, WorkflowError>,
        queue: &mut VecDeque<Uuid>,
    ) -> Result<(), ExecutorError> {
        let Some(parent) = &record.parent else {
            return Ok(());
        };

        let parent_record = match self.store.get_run(parent.run_id).await {
            Ok(parent_record) => parent_record,
            Err(StoreError::RunNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if parent_record.status.is_terminal() {
            return Ok(());
        }

        let kind = match outcome {
            Ok(result) => EventKind::ChildWorkflowCompleted {
                child_workflow_id: record.workflow_id.clone(),
                result,
            },
            Err(error) => EventKind::ChildWorkflowFailed {
                child_workflow_id: record.workflow_id.clone(),
                error,
            },
        };

        self.append_at_end(parent.run_id, vec![kind]).await?;

        queue.push_back(parent.run_id);
        Ok(())
    }

    async fn drain(&self, mut queue: VecDeque<Uuid>) -> Result<(), ExecutorError> {
        while let Some(run_id) = queue.pop_front() {
            self.process_single(run_id, &mut queue).await?;
        }
        Ok(())
    }

    /// Fail a run whose processing keeps erroring.
    async fn fail_poisoned(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let record = self.store.get_run(run_id).await?;
        if record.status.is_terminal() {
            return Ok(());
        }

        error!(
            workflow_id = %record.workflow_id,
            %run_id,
            "repeated decision failures; failing run as nondeterministic"
        );

        let error = WorkflowError::new("replay produced inconsistent decisions")
            .with_code("NonDeterminismDetected");
        self.append_at_end(
            run_id,
            vec![EventKind::WorkflowFailed {
                error: error.clone(),
            }],
        )
        .await?;
        self.store
            .update_run_status(run_id, WorkflowStatus::Failed, None, Some(error.clone()))
            .await?;

        let mut queue = VecDeque::new();
        self.notify_parent(&record, Err(error), &mut queue).await?;
        self.drain(queue).await
    }
}

fn timeout_error_type(timeout: crate::workflow::TimeoutKind) -> &'static str {
    use crate::activity::error_types;
    use crate::workflow::TimeoutKind;

    match timeout {
        TimeoutKind::ScheduleToStart => error_types::START_TIMEOUT,
        TimeoutKind::StartToClose => error_types::EXECUTION_TIMEOUT,
        TimeoutKind::Heartbeat => error_types::HEARTBEAT_TIMEOUT,
        TimeoutKind::ScheduleToClose => error_types::SCHEDULE_TO_CLOSE_TIMEOUT,
    }
}
