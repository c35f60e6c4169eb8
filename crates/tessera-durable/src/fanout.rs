//! Signal fanout
//!
//! Persists workflow progress signals as an ordered per-principal inbox and
//! pushes them to live subscribers. Delivery is at-least-once: the inbox is
//! the durable record, the broadcast channel the live path, and the
//! monotonic per-principal `sequence` lets subscribers deduplicate by
//! `(principal, sequence)` and catch up after reconnecting.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::persistence::{ExecutionStore, InboxKind, InboxSignal, StoreError};

const SUBSCRIBER_BUFFER: usize = 256;

/// Fans workflow signals out to principal inboxes and live subscribers.
pub struct SignalFanout {
    store: Arc<dyn ExecutionStore>,
    subscribers: DashMap<String, broadcast::Sender<InboxSignal>>,
}

impl SignalFanout {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            subscribers: DashMap::new(),
        }
    }

    /// Persist a signal for a principal and push it to live subscribers.
    ///
    /// Returns the stored entry including its assigned sequence.
    pub async fn publish(
        &self,
        principal: &str,
        workflow_id: &str,
        kind: InboxKind,
        payload: serde_json::Value,
    ) -> Result<InboxSignal, StoreError> {
        let signal = self
            .store
            .append_inbox(principal, workflow_id, kind, payload)
            .await?;

        if let Some(sender) = self.subscribers.get(principal) {
            // A full or closed channel only affects the live path; the inbox
            // already holds the durable copy.
            let _ = sender.send(signal.clone());
        }

        debug!(
            principal,
            workflow_id,
            sequence = signal.sequence,
            "signal fanned out"
        );

        Ok(signal)
    }

    /// Subscribe to a principal's live signal stream.
    pub fn subscribe(&self, principal: &str) -> broadcast::Receiver<InboxSignal> {
        self.subscribers
            .entry(principal.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe()
    }

    /// Inbox entries a reconnecting subscriber missed.
    pub async fn catch_up(
        &self,
        principal: &str,
        after_sequence: i64,
    ) -> Result<Vec<InboxSignal>, StoreError> {
        self.store.inbox_after(principal, after_sequence).await
    }

    /// Drop subscriber channels nobody listens to anymore.
    pub fn prune_subscribers(&self) {
        self.subscribers
            .retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryExecutionStore;
    use serde_json::json;

    fn fanout() -> SignalFanout {
        SignalFanout::new(Arc::new(InMemoryExecutionStore::new()))
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequence() {
        let fanout = fanout();

        let first = fanout
            .publish("u1", "doc-d1", InboxKind::Progress, json!({"step": "download"}))
            .await
            .unwrap();
        let second = fanout
            .publish("u1", "doc-d1", InboxKind::Completion, json!({"state": "PUBLISHED"}))
            .await
            .unwrap();

        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn test_live_subscriber_receives_signal() {
        let fanout = fanout();
        let mut rx = fanout.subscribe("u1");

        fanout
            .publish("u1", "doc-d1", InboxKind::Status, json!({"status": "processing"}))
            .await
            .unwrap();

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.workflow_id, "doc-d1");
        assert_eq!(signal.kind, InboxKind::Status);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_still_persists() {
        let fanout = fanout();

        fanout
            .publish("u1", "doc-d1", InboxKind::Error, json!({"detail": "boom"}))
            .await
            .unwrap();

        let missed = fanout.catch_up("u1", 0).await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].kind, InboxKind::Error);
    }

    #[tokio::test]
    async fn test_catch_up_skips_seen_sequences() {
        let fanout = fanout();

        for i in 0..3 {
            fanout
                .publish("u1", "doc-d1", InboxKind::Progress, json!({"i": i}))
                .await
                .unwrap();
        }

        let missed = fanout.catch_up("u1", 2).await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].sequence, 3);
    }

    #[tokio::test]
    async fn test_principals_are_isolated() {
        let fanout = fanout();
        let mut rx_u2 = fanout.subscribe("u2");

        fanout
            .publish("u1", "doc-d1", InboxKind::Progress, json!({}))
            .await
            .unwrap();

        assert!(rx_u2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prune_subscribers() {
        let fanout = fanout();
        {
            let _rx = fanout.subscribe("u1");
            assert_eq!(fanout.subscribers.len(), 1);
        }
        fanout.prune_subscribers();
        assert_eq!(fanout.subscribers.len(), 0);
    }
}
