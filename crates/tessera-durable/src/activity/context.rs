//! Activity execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (activity cancelled or timed out)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Activity was cancelled
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// Carries attempt information, the execution deadline, a heartbeat sink for
/// long-running work, and a cooperative cancellation token.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for chunk in chunks {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::cancelled("stopping at chunk boundary"));
///         }
///         process(chunk).await?;
///         ctx.heartbeat(Some(json!({"done": chunk.index}))).await?;
///     }
///     Ok(output)
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Workflow that scheduled this activity
    pub workflow_id: String,

    /// Run that scheduled this activity
    pub run_id: Uuid,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Deadline for this attempt (start + start_to_close_timeout)
    pub deadline: DateTime<Utc>,

    /// Heartbeat sender
    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    /// Cancellation flag
    cancelled: Arc<AtomicBool>,
}

impl ActivityContext {
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: Uuid,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
            activity_id: activity_id.into(),
            attempt,
            max_attempts,
            deadline,
            heartbeat_tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a heartbeat channel.
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// A handle the worker uses to request cancellation.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Record a heartbeat, optionally carrying progress details.
    ///
    /// Heartbeats renew the task lease and surface progress; the send fails
    /// once the activity has been cancelled or the worker tore the channel
    /// down.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves when cancellation is requested; useful in `select!`.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Time remaining before the attempt deadline.
    pub fn remaining(&self) -> std::time::Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or_default()
    }

    /// Whether this is the final retry attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel an activity
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn test_context() -> ActivityContext {
        ActivityContext::new(
            "doc-d1",
            Uuid::now_v7(),
            "download",
            1,
            3,
            Utc::now() + ChronoDuration::seconds(300),
        )
    }

    #[test]
    fn test_context_creation() {
        let ctx = test_context();
        assert_eq!(ctx.activity_id, "download");
        assert_eq!(ctx.attempt, 1);
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_last_attempt());
        assert!(ctx.remaining() > std::time::Duration::from_secs(290));
    }

    #[test]
    fn test_is_last_attempt() {
        let mut ctx = test_context();
        ctx.attempt = 3;
        assert!(ctx.is_last_attempt());
    }

    #[test]
    fn test_cancellation() {
        let ctx = test_context();
        let handle = ctx.cancellation_handle();

        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_heartbeat_when_cancelled() {
        let ctx = test_context();
        ctx.cancellation_handle().cancel();

        let result = ctx.heartbeat(None).await;
        assert!(matches!(result, Err(HeartbeatError::Cancelled)));
    }

    #[tokio::test]
    async fn test_heartbeat_with_channel() {
        let (tx, mut rx) = mpsc::channel(10);
        let ctx = test_context().with_heartbeat(tx);

        ctx.heartbeat(Some(serde_json::json!({"chunks_done": 5})))
            .await
            .unwrap();

        let payload = rx.recv().await.unwrap();
        assert!(payload.details.is_some());
    }
}
