//! Activity handler registration
//!
//! Adapters (blob, vector, graph, LLM, metadata) are constructed once at
//! process start and injected into activity values, which are then
//! registered here. Workers resolve handlers by activity type; an unknown
//! type fails the task with a non-retryable `ActivityTypeNotRegistered`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::definition::{error_types, Activity, ActivityError};
use super::ActivityContext;

/// Outcome of a single activity attempt.
pub type ActivityResult = Result<Value, ActivityError>;

/// Type-erased activity handler.
pub type ActivityHandler = Arc<
    dyn Fn(ActivityContext, Value) -> Pin<Box<dyn Future<Output = ActivityResult> + Send>>
        + Send
        + Sync,
>;

/// Registration table mapping activity types to handlers.
#[derive(Default)]
pub struct ActivitySet {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity. Input/output (de)serialization happens at
    /// the boundary; handlers stay fully typed.
    pub fn register<A: Activity>(&mut self, activity: A) {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx, input| {
            let activity = Arc::clone(&activity);
            Box::pin(async move {
                let input: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid activity input: {e}"))
                        .with_type(error_types::INVALID_INPUT)
                })?;

                let output = activity.execute(&ctx, input).await?;

                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!("activity output not serializable: {e}"))
                })
            })
        });

        self.handlers.insert(A::TYPE.to_string(), handler);
    }

    /// Look up a handler by activity type.
    pub fn get(&self, activity_type: &str) -> Option<ActivityHandler> {
        self.handlers.get(activity_type).cloned()
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// All registered activity types, sorted.
    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActivitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivitySet")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct EchoInput {
        message: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct EchoOutput {
        echoed: String,
    }

    struct EchoActivity;

    #[async_trait]
    impl Activity for EchoActivity {
        const TYPE: &'static str = "echo";
        type Input = EchoInput;
        type Output = EchoOutput;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(EchoOutput {
                echoed: input.message,
            })
        }
    }

    fn test_ctx() -> ActivityContext {
        ActivityContext::new(
            "wf",
            Uuid::now_v7(),
            "echo-1",
            1,
            1,
            Utc::now() + chrono::Duration::seconds(60),
        )
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut set = ActivitySet::new();
        set.register(EchoActivity);

        assert!(set.contains("echo"));
        assert_eq!(set.activity_types(), vec!["echo"]);

        let handler = set.get("echo").unwrap();
        let result = handler(test_ctx(), serde_json::json!({"message": "hi"}))
            .await
            .unwrap();

        assert_eq!(result, serde_json::json!({"echoed": "hi"}));
    }

    #[tokio::test]
    async fn test_invalid_input_is_non_retryable() {
        let mut set = ActivitySet::new();
        set.register(EchoActivity);

        let handler = set.get("echo").unwrap();
        let error = handler(test_ctx(), serde_json::json!({"wrong": true}))
            .await
            .unwrap_err();

        assert!(!error.retryable);
        assert_eq!(error.error_type.as_deref(), Some(error_types::INVALID_INPUT));
    }

    #[test]
    fn test_unknown_type() {
        let set = ActivitySet::new();
        assert!(set.get("nope").is_none());
    }
}
