//! Notification port
//!
//! Activities deliver progress and completion signals to principals through
//! this port; in production it fans out via the engine's `SignalFanout`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use tessera_durable::persistence::InboxKind;
use tessera_durable::SignalFanout;

use super::AdapterError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        principal: &str,
        workflow_id: &str,
        kind: InboxKind,
        payload: serde_json::Value,
    ) -> Result<(), AdapterError>;
}

/// Production notifier: persists to the principal inbox and pushes to live
/// subscribers.
pub struct FanoutNotifier {
    fanout: Arc<SignalFanout>,
}

impl FanoutNotifier {
    pub fn new(fanout: Arc<SignalFanout>) -> Self {
        Self { fanout }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(
        &self,
        principal: &str,
        workflow_id: &str,
        kind: InboxKind,
        payload: serde_json::Value,
    ) -> Result<(), AdapterError> {
        self.fanout
            .publish(principal, workflow_id, kind, payload)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        Ok(())
    }
}

/// Recording notifier for tests.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(String, String, InboxKind, serde_json::Value)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String, InboxKind, serde_json::Value)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(
        &self,
        principal: &str,
        workflow_id: &str,
        kind: InboxKind,
        payload: serde_json::Value,
    ) -> Result<(), AdapterError> {
        self.sent.lock().push((
            principal.to_string(),
            workflow_id.to_string(),
            kind,
            payload,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_durable::InMemoryExecutionStore;

    #[tokio::test]
    async fn test_memory_notifier_records() {
        let notifier = MemoryNotifier::new();
        notifier
            .notify("u1", "doc-d1", InboxKind::Completion, json!({"state": "PUBLISHED"}))
            .await
            .unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "u1");
        assert_eq!(sent[0].2, InboxKind::Completion);
    }

    #[tokio::test]
    async fn test_fanout_notifier_persists_to_inbox() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let fanout = Arc::new(SignalFanout::new(
            store.clone() as Arc<dyn tessera_durable::ExecutionStore>
        ));
        let notifier = FanoutNotifier::new(fanout.clone());

        notifier
            .notify("u1", "doc-d1", InboxKind::Progress, json!({"step": "embedding"}))
            .await
            .unwrap();

        let missed = fanout.catch_up("u1", 0).await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].workflow_id, "doc-d1");
    }
}
