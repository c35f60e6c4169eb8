//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Well-known error type tags used by the engine itself.
pub mod error_types {
    /// Worker has no handler for the activity type; never retried.
    pub const ACTIVITY_TYPE_NOT_REGISTERED: &str = "ActivityTypeNotRegistered";

    /// Activity observed cancellation and stopped.
    pub const CANCELLED: &str = "Cancelled";

    /// Task sat unclaimed past schedule_to_start_timeout.
    pub const START_TIMEOUT: &str = "StartTimeout";

    /// Attempt ran past start_to_close_timeout.
    pub const EXECUTION_TIMEOUT: &str = "ExecutionTimeout";

    /// Worker missed a heartbeat window.
    pub const HEARTBEAT_TIMEOUT: &str = "HeartbeatTimeout";

    /// Overall schedule_to_close budget exhausted.
    pub const SCHEDULE_TO_CLOSE_TIMEOUT: &str = "ScheduleToCloseTimeout";

    /// Activity input failed to deserialize.
    pub const INVALID_INPUT: &str = "InvalidInput";
}

/// Error type for activity failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type for programmatic handling and non-retryable matching
    pub error_type: Option<String>,

    /// Whether this error is retryable. Non-retryable errors fail the
    /// activity immediately, regardless of remaining attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a retryable (transient) error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable (permanent) error.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// A cancellation outcome; the workflow decides whether it is terminal.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::non_retryable(message).with_type(error_types::CANCELLED)
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether this error reports cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.error_type.as_deref() == Some(error_types::CANCELLED)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is an externally-effecting unit of work executed by a worker.
///
/// Activities may fail and be retried, so every external write must be
/// idempotent: write under a deterministic key and upsert.
///
/// # Example
///
/// ```ignore
/// struct DownloadBlob { blobs: Arc<dyn BlobStore> }
///
/// #[async_trait]
/// impl Activity for DownloadBlob {
///     const TYPE: &'static str = "download_blob";
///     type Input = DownloadBlobInput;
///     type Output = DownloadBlobOutput;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         let bytes = self.blobs.get(&input.blob_path).await?;
///         Ok(DownloadBlobOutput { size: bytes.len() as u64, .. })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier used by workers to resolve the handler.
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity.
    ///
    /// Return `ActivityError::retryable` for transient failures and
    /// `ActivityError::non_retryable` for permanent ones. Long-running
    /// implementations must heartbeat through the context and observe its
    /// cancellation token.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_error() {
        let error = ActivityError::retryable("connection reset");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "connection reset");
    }

    #[test]
    fn test_non_retryable_error() {
        let error = ActivityError::non_retryable("unknown document");
        assert!(!error.retryable);
    }

    #[test]
    fn test_cancelled_error() {
        let error = ActivityError::cancelled("drain requested");
        assert!(error.is_cancelled());
        assert!(!error.retryable);
    }

    #[test]
    fn test_error_serialization() {
        let error = ActivityError::retryable("upstream 503")
            .with_type("Transient")
            .with_details(serde_json::json!({"status": 503}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();

        assert_eq!(error, parsed);
    }
}
