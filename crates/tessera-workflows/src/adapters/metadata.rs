//! Relational metadata store port
//!
//! Row-level upserts keyed by business id; re-running any write after a
//! retry leaves a single row.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::AdapterError;

/// A document row as the platform tracks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRow {
    pub tenant: String,
    pub document_id: String,
    pub state: String,
    pub extra: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Upsert a document's lifecycle state, keyed by `(tenant, document_id)`.
    async fn upsert_document(
        &self,
        tenant: &str,
        document_id: &str,
        state: &str,
        extra: serde_json::Value,
    ) -> Result<(), AdapterError>;

    async fn get_document(
        &self,
        tenant: &str,
        document_id: &str,
    ) -> Result<Option<DocumentRow>, AdapterError>;

    /// Upsert a question's answer, keyed by `(tenant, question_id)`.
    async fn upsert_answer(
        &self,
        tenant: &str,
        question_id: &str,
        answer: serde_json::Value,
    ) -> Result<(), AdapterError>;

    async fn get_answer(
        &self,
        tenant: &str,
        question_id: &str,
    ) -> Result<Option<serde_json::Value>, AdapterError>;

    /// Create (or re-create idempotently) a review task row.
    async fn create_review(
        &self,
        tenant: &str,
        review_id: &str,
        reviewable_type: &str,
        reviewable_id: &str,
    ) -> Result<(), AdapterError>;

    /// Record a quality score for a reviewable.
    async fn update_quality_score(
        &self,
        tenant: &str,
        reviewable_id: &str,
        score: f64,
    ) -> Result<(), AdapterError>;
}

/// In-memory metadata store for tests.
#[derive(Default)]
pub struct MemoryMetadataStore {
    documents: RwLock<HashMap<(String, String), DocumentRow>>,
    answers: RwLock<HashMap<(String, String), serde_json::Value>>,
    reviews: RwLock<HashMap<(String, String), (String, String)>>,
    quality_scores: RwLock<HashMap<(String, String), f64>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a document (test helper).
    pub fn document_state(&self, tenant: &str, document_id: &str) -> Option<String> {
        self.documents
            .read()
            .get(&(tenant.to_string(), document_id.to_string()))
            .map(|row| row.state.clone())
    }

    /// Recorded quality score (test helper).
    pub fn quality_score(&self, tenant: &str, reviewable_id: &str) -> Option<f64> {
        self.quality_scores
            .read()
            .get(&(tenant.to_string(), reviewable_id.to_string()))
            .copied()
    }

    /// Whether a review row exists (test helper).
    pub fn has_review(&self, tenant: &str, review_id: &str) -> bool {
        self.reviews
            .read()
            .contains_key(&(tenant.to_string(), review_id.to_string()))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn upsert_document(
        &self,
        tenant: &str,
        document_id: &str,
        state: &str,
        extra: serde_json::Value,
    ) -> Result<(), AdapterError> {
        self.documents.write().insert(
            (tenant.to_string(), document_id.to_string()),
            DocumentRow {
                tenant: tenant.to_string(),
                document_id: document_id.to_string(),
                state: state.to_string(),
                extra,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_document(
        &self,
        tenant: &str,
        document_id: &str,
    ) -> Result<Option<DocumentRow>, AdapterError> {
        Ok(self
            .documents
            .read()
            .get(&(tenant.to_string(), document_id.to_string()))
            .cloned())
    }

    async fn upsert_answer(
        &self,
        tenant: &str,
        question_id: &str,
        answer: serde_json::Value,
    ) -> Result<(), AdapterError> {
        self.answers
            .write()
            .insert((tenant.to_string(), question_id.to_string()), answer);
        Ok(())
    }

    async fn get_answer(
        &self,
        tenant: &str,
        question_id: &str,
    ) -> Result<Option<serde_json::Value>, AdapterError> {
        Ok(self
            .answers
            .read()
            .get(&(tenant.to_string(), question_id.to_string()))
            .cloned())
    }

    async fn create_review(
        &self,
        tenant: &str,
        review_id: &str,
        reviewable_type: &str,
        reviewable_id: &str,
    ) -> Result<(), AdapterError> {
        self.reviews.write().insert(
            (tenant.to_string(), review_id.to_string()),
            (reviewable_type.to_string(), reviewable_id.to_string()),
        );
        Ok(())
    }

    async fn update_quality_score(
        &self,
        tenant: &str,
        reviewable_id: &str,
        score: f64,
    ) -> Result<(), AdapterError> {
        self.quality_scores
            .write()
            .insert((tenant.to_string(), reviewable_id.to_string()), score);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_document_upsert_is_idempotent() {
        let store = MemoryMetadataStore::new();

        store
            .upsert_document("t", "d1", "PUBLISHED", json!({}))
            .await
            .unwrap();
        store
            .upsert_document("t", "d1", "PUBLISHED", json!({}))
            .await
            .unwrap();

        assert_eq!(store.document_state("t", "d1").as_deref(), Some("PUBLISHED"));
        assert_eq!(store.documents.read().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_round_trip() {
        let store = MemoryMetadataStore::new();
        store
            .upsert_answer("t", "q1", json!({"answer": "42"}))
            .await
            .unwrap();

        let answer = store.get_answer("t", "q1").await.unwrap().unwrap();
        assert_eq!(answer["answer"], "42");
    }

    #[tokio::test]
    async fn test_review_and_score() {
        let store = MemoryMetadataStore::new();
        store
            .create_review("t", "r1", "answer", "q1")
            .await
            .unwrap();
        store.update_quality_score("t", "q1", 1.0).await.unwrap();

        assert!(store.has_review("t", "r1"));
        assert_eq!(store.quality_score("t", "q1"), Some(1.0));
    }
}
