//! Workflow trait definition
//!
//! A workflow is a deterministic state machine driven by replayed history
//! events. Definitions must not read wall-clock time, randomness, the
//! filesystem or the network; everything nondeterministic arrives through
//! the [`WorkflowContext`] or as activity results.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::{Decision, Signal};
use crate::activity::ActivityError;

/// Error type for workflow failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// Replay-safe facts about the current execution, handed to every hook.
///
/// `now()` is the timestamp of the history event being applied, so a
/// definition that computes deadlines from it sees identical values on every
/// replay.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    /// Caller-supplied workflow identifier (stable across continue-as-new).
    pub workflow_id: String,

    /// Engine-generated run identifier.
    pub run_id: Uuid,

    /// Tenant tag this execution belongs to.
    pub tenant: String,

    event_time: DateTime<Utc>,

    history_len: usize,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: Uuid,
        tenant: impl Into<String>,
        event_time: DateTime<Utc>,
        history_len: usize,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
            tenant: tenant.into(),
            event_time,
            history_len,
        }
    }

    /// Deterministic "current time": the timestamp of the event that
    /// triggered this hook, drawn from history.
    pub fn now(&self) -> DateTime<Utc> {
        self.event_time
    }

    /// Number of events already in this run's history. Definitions use this
    /// to elect continue-as-new before hitting the history cap.
    pub fn history_len(&self) -> usize {
        self.history_len
    }
}

/// A workflow is a deterministic state machine driven by events
///
/// Definitions express concurrency by scheduling several activities in one
/// decision batch and advancing when the matching completion events arrive.
/// Suspension is implicit: a definition that returns no terminal decision
/// simply stays unfinished until a later event (activity result, timer fire,
/// signal) advances it.
///
/// # Determinism
///
/// Given the same sequence of events, a definition must produce the same
/// sequence of decisions; this is what makes replay-based recovery possible.
/// Iterate only over ordered containers, and take time from
/// [`WorkflowContext::now`].
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier used to look up the definition during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when the workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new instance from input. Called both on first start and on
    /// every replay.
    fn new(input: Self::Input) -> Self;

    /// Called when the workflow starts (or replays from the beginning).
    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<Decision>;

    /// Called when an activity completes successfully.
    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<Decision>;

    /// Called when an activity fails terminally (retries exhausted, a
    /// non-retryable error, or an unrecoverable timeout).
    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<Decision>;

    /// Called when a timer fires.
    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<Decision> {
        let _ = (ctx, timer_id);
        vec![]
    }

    /// Called when an external signal is consumed from the channel.
    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &Signal) -> Vec<Decision> {
        let _ = (ctx, signal);
        vec![]
    }

    /// Called when a child workflow completes.
    fn on_child_completed(
        &mut self,
        ctx: &WorkflowContext,
        child_workflow_id: &str,
        result: serde_json::Value,
    ) -> Vec<Decision> {
        let _ = (ctx, child_workflow_id, result);
        vec![]
    }

    /// Called when a child workflow fails or is terminated.
    fn on_child_failed(
        &mut self,
        ctx: &WorkflowContext,
        child_workflow_id: &str,
        error: &WorkflowError,
    ) -> Vec<Decision> {
        let _ = (ctx, child_workflow_id, error);
        vec![]
    }

    /// Side-effect-free read of replayed state, served by query endpoints.
    /// Never appends to history.
    fn query(&self, query_name: &str) -> Option<serde_json::Value> {
        let _ = query_name;
        None
    }

    /// Whether the workflow has reached a terminal state.
    fn is_finished(&self) -> bool;

    /// The workflow result (if completed successfully).
    fn result(&self) -> Option<Self::Output>;

    /// The workflow error (if failed).
    fn error(&self) -> Option<WorkflowError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong");
        assert_eq!(error.to_string(), "something went wrong");
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::new("rolled back").with_code("partial_publish_rolled_back");
        assert_eq!(error.code.as_deref(), Some("partial_publish_rolled_back"));
    }

    #[test]
    fn test_context_now_is_event_time() {
        let event_time = Utc::now();
        let ctx = WorkflowContext::new("doc-d1", Uuid::now_v7(), "tenant-a", event_time, 7);

        assert_eq!(ctx.now(), event_time);
        assert_eq!(ctx.history_len(), 7);
    }
}
