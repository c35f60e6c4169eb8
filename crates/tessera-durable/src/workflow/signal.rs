//! Workflow signals
//!
//! Signals are typed messages delivered asynchronously to a running
//! execution. Each execution owns a name-addressed FIFO channel; delivery is
//! observable only at the next processing pass, never mid-decision. The
//! channel is bounded; senders see `ChannelFull` past the cap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum pending signals per execution before sends are rejected.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

/// A signal delivered to a workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Channel name the workflow awaits on (e.g. `controller_decision`).
    pub name: String,

    /// Signal payload (JSON).
    pub payload: serde_json::Value,

    /// When the signal was sent.
    pub sent_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Verdict carried by a review decision signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    Reject,
    ChangesRequested,
    /// Quality review only: revert previously published artifacts.
    Rollback,
}

/// Payload of the human-in-the-loop decision signals
/// (`controller_decision`, `review_decision`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub decision: ReviewVerdict,

    /// Principal of the reviewer who decided.
    pub reviewer_principal: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    pub decided_at: DateTime<Utc>,
}

impl ReviewDecision {
    pub fn new(decision: ReviewVerdict, reviewer_principal: impl Into<String>) -> Self {
        Self {
            decision,
            reviewer_principal: reviewer_principal.into(),
            comment: None,
            decided_at: Utc::now(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_round_trip() {
        let signal = Signal::new("controller_decision", json!({"decision": "approve"}));

        let json = serde_json::to_string(&signal).unwrap();
        let parsed: Signal = serde_json::from_str(&json).unwrap();

        assert_eq!(signal.name, parsed.name);
        assert_eq!(signal.payload, parsed.payload);
    }

    #[test]
    fn test_decode_review_decision() {
        let decision = ReviewDecision::new(ReviewVerdict::Approve, "u1").with_comment("lgtm");
        let signal = Signal::new("controller_decision", serde_json::to_value(&decision).unwrap());

        let decoded: ReviewDecision = signal.decode().unwrap();
        assert_eq!(decoded.decision, ReviewVerdict::Approve);
        assert_eq!(decoded.reviewer_principal, "u1");
        assert_eq!(decoded.comment.as_deref(), Some("lgtm"));
    }

    #[test]
    fn test_verdict_wire_format() {
        let json = serde_json::to_string(&ReviewVerdict::ChangesRequested).unwrap();
        assert_eq!(json, "\"changes_requested\"");
    }
}
