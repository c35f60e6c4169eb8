//! Workflow decisions and activity options
//!
//! Decisions are the commands a workflow issues in response to history
//! events. Each decision is persisted as a [`EventKind`](super::EventKind)
//! before any side effect happens.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::attributes::AttributeMap;
use super::WorkflowError;
use crate::reliability::retry::{duration_millis, option_duration_millis};
use crate::reliability::RetryPolicy;
use crate::router::TaskQueue;

/// A command issued by a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Schedule an activity for execution on a task queue.
    ScheduleActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up the handler)
        activity_type: String,

        /// Target queue; `None` uses the routing-table default.
        queue: Option<TaskQueue>,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a timer that fires at-or-after the given duration.
    StartTimer {
        timer_id: String,

        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Request cancellation of a scheduled or running activity.
    CancelActivity { activity_id: String },

    /// Publish indexed search attributes for this execution.
    UpsertSearchAttributes { attributes: AttributeMap },

    /// Start a child workflow; its terminal event is routed back to this
    /// execution (one-way reference, never a pointer).
    StartChildWorkflow {
        child_workflow_id: String,
        workflow_type: String,
        input: serde_json::Value,
    },

    /// Complete the workflow successfully with a result.
    CompleteWorkflow { result: serde_json::Value },

    /// Fail the workflow with an error.
    FailWorkflow { error: WorkflowError },

    /// Close this run and start a fresh one under the same workflow_id with
    /// an empty history.
    ContinueAsNew { input: serde_json::Value },
}

impl Decision {
    /// Schedule an activity with default options on its default queue.
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            queue: None,
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Schedule an activity with explicit options.
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            queue: None,
            input,
            options,
        }
    }

    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    pub fn upsert_attributes(attributes: AttributeMap) -> Self {
        Self::UpsertSearchAttributes { attributes }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Pin this decision to an explicit queue (schedule-activity only).
    pub fn on_queue(mut self, target: TaskQueue) -> Self {
        if let Self::ScheduleActivity { ref mut queue, .. } = self {
            *queue = Some(target);
        }
        self
    }

    /// Whether this decision closes the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::ContinueAsNew { .. }
        )
    }
}

/// Options for activity execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Retry policy applied by the router on failure.
    pub retry_policy: RetryPolicy,

    /// Maximum time a task may sit unclaimed; expiry is a terminal start
    /// timeout.
    #[serde(with = "duration_millis")]
    pub schedule_to_start_timeout: Duration,

    /// Maximum single-attempt execution time; doubles as the lease length
    /// for non-heartbeating activities.
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,

    /// Overall budget spanning all retries; `None` means unbounded.
    #[serde(default, with = "option_duration_millis")]
    pub schedule_to_close_timeout: Option<Duration>,

    /// Heartbeat window for long-running activities. Missing a window
    /// revokes the lease and the attempt is retried per policy.
    #[serde(default, with = "option_duration_millis")]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(300),
            schedule_to_close_timeout: None,
            heartbeat_timeout: None,
        }
    }
}

impl ActivityOptions {
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = timeout;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    pub fn with_schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = Some(timeout);
        self
    }

    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_defaults() {
        let decision =
            Decision::schedule_activity("step-1", "download_blob", json!({"path": "a/b"}));

        match decision {
            Decision::ScheduleActivity {
                activity_id,
                activity_type,
                queue,
                input,
                ..
            } => {
                assert_eq!(activity_id, "step-1");
                assert_eq!(activity_type, "download_blob");
                assert_eq!(queue, None);
                assert_eq!(input, json!({"path": "a/b"}));
            }
            _ => panic!("expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_on_queue_pins_target() {
        let decision = Decision::schedule_activity("step-1", "custom_check", json!({}))
            .on_queue(TaskQueue::General);

        match decision {
            Decision::ScheduleActivity { queue, .. } => {
                assert_eq!(queue, Some(TaskQueue::General));
            }
            _ => panic!("expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_terminal_decisions() {
        assert!(Decision::complete(json!({})).is_terminal());
        assert!(Decision::fail(WorkflowError::new("boom")).is_terminal());
        assert!(Decision::ContinueAsNew { input: json!({}) }.is_terminal());
        assert!(!Decision::timer("t", Duration::from_secs(1)).is_terminal());
    }

    #[test]
    fn test_decision_serialization() {
        let decision = Decision::ScheduleActivity {
            activity_id: "a".to_string(),
            activity_type: "assess_relevance".to_string(),
            queue: Some(TaskQueue::AiProcessing),
            input: json!({}),
            options: ActivityOptions::default(),
        };

        let json = serde_json::to_string(&decision).unwrap();
        assert!(json.contains("\"type\":\"schedule_activity\""));

        let parsed: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(decision, parsed);
    }

    #[test]
    fn test_activity_options_serialization() {
        let options = ActivityOptions::default()
            .with_heartbeat(Duration::from_secs(30))
            .with_schedule_to_close_timeout(Duration::from_secs(900));

        let json = serde_json::to_string(&options).unwrap();
        let parsed: ActivityOptions = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.heartbeat_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            parsed.schedule_to_close_timeout,
            Some(Duration::from_secs(900))
        );
    }
}
