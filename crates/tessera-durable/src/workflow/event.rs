//! Workflow history events
//!
//! Events form the append-only log of a run. They are immutable once
//! written; workflow state is reconstructed by replaying them in event-id
//! order. Replay of the same history must always produce the same sequence
//! of decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attributes::AttributeMap;
use super::decision::ActivityOptions;
use super::signal::Signal;
use super::WorkflowError;
use crate::activity::ActivityError;
use crate::router::TaskQueue;

/// Timeout classes an activity can hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Task was not claimed within schedule_to_start_timeout.
    ScheduleToStart,

    /// Attempt did not finish within start_to_close_timeout.
    StartToClose,

    /// Worker missed a heartbeat window.
    Heartbeat,

    /// Overall schedule_to_close budget (spanning retries) was spent.
    ScheduleToClose,
}

/// An event in a run's history, stamped by the store on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Monotonically increasing id within the run, starting at 0.
    pub event_id: i64,

    pub timestamp: DateTime<Utc>,

    pub kind: EventKind,
}

/// Event kinds recorded in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow run started with the given input.
    WorkflowStarted { input: serde_json::Value },

    /// Workflow completed successfully.
    WorkflowCompleted { result: serde_json::Value },

    /// Workflow failed with an error.
    WorkflowFailed { error: WorkflowError },

    /// Workflow was terminated by an operator; no replay happens afterwards.
    WorkflowTerminated { reason: String },

    /// Run closed and a fresh run was started under the same workflow_id.
    ContinueAsNew {
        input: serde_json::Value,
        new_run_id: Uuid,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled onto a task queue.
    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        queue: TaskQueue,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Activity execution started (claimed by a worker).
    ActivityStarted {
        activity_id: String,
        /// Current attempt number (1-based)
        attempt: u32,
        worker_id: String,
    },

    /// Activity completed successfully.
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },

    /// Activity failed; `will_retry` records whether the router re-enqueued
    /// the task. Only final failures advance the workflow.
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
        will_retry: bool,
    },

    /// Activity hit a timeout class.
    ActivityTimedOut {
        activity_id: String,
        timeout: TimeoutKind,
        will_retry: bool,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was started; fires at-or-after `fire_at`, never earlier.
    TimerStarted {
        timer_id: String,
        fire_at: DateTime<Utc>,
    },

    /// Timer fired.
    TimerFired { timer_id: String },

    // =========================================================================
    // Signal and Attribute Events
    // =========================================================================
    /// External signal was consumed by the workflow.
    SignalReceived { signal: Signal },

    /// Search attributes were published to the index.
    SearchAttributesUpserted { attributes: AttributeMap },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// Child workflow was started.
    ChildWorkflowStarted {
        child_workflow_id: String,
        workflow_type: String,
    },

    /// Child workflow completed successfully.
    ChildWorkflowCompleted {
        child_workflow_id: String,
        result: serde_json::Value,
    },

    /// Child workflow failed or was terminated.
    ChildWorkflowFailed {
        child_workflow_id: String,
        error: WorkflowError,
    },
}

impl EventKind {
    /// The activity_id if this is an activity-related event.
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityStarted { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityTimedOut { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Whether this event closes the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowTerminated { .. }
                | Self::ContinueAsNew { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_serialization() {
        let kind = EventKind::WorkflowStarted {
            input: json!({"document_id": "d1"}),
        };

        let json = serde_json::to_string(&kind).unwrap();
        assert!(json.contains("\"type\":\"workflow_started\""));

        let parsed: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(kind, parsed);
    }

    #[test]
    fn test_activity_scheduled_round_trip() {
        let kind = EventKind::ActivityScheduled {
            activity_id: "assess".to_string(),
            activity_type: "assess_relevance".to_string(),
            queue: TaskQueue::AiProcessing,
            input: json!({}),
            options: ActivityOptions::default(),
        };

        let json = serde_json::to_string(&kind).unwrap();
        let parsed: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(kind, parsed);
    }

    #[test]
    fn test_activity_id_extraction() {
        let kind = EventKind::ActivityStarted {
            activity_id: "download".to_string(),
            attempt: 1,
            worker_id: "worker-1".to_string(),
        };
        assert_eq!(kind.activity_id(), Some("download"));

        let kind = EventKind::TimerFired {
            timer_id: "review-deadline".to_string(),
        };
        assert_eq!(kind.activity_id(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(EventKind::WorkflowCompleted { result: json!({}) }.is_terminal());
        assert!(EventKind::WorkflowFailed {
            error: WorkflowError::new("error")
        }
        .is_terminal());
        assert!(EventKind::WorkflowTerminated {
            reason: "operator".to_string()
        }
        .is_terminal());
        assert!(EventKind::ContinueAsNew {
            input: json!({}),
            new_run_id: Uuid::now_v7(),
        }
        .is_terminal());

        assert!(!EventKind::WorkflowStarted { input: json!({}) }.is_terminal());
        assert!(!EventKind::ActivityCompleted {
            activity_id: "x".to_string(),
            result: json!({}),
        }
        .is_terminal());
    }
}
