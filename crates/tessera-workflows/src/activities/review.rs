//! Quality-review activities
//!
//! Applying a reviewer's decision to a reviewable: publish, archive, and the
//! quality-score bookkeeping that follows.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tessera_durable::{Activity, ActivityContext, ActivityError, ActivitySet};

use crate::adapters::{Adapters, MetadataStore};

/// Register every review activity.
pub fn register(set: &mut ActivitySet, adapters: &Adapters) {
    set.register(PublishReviewable {
        metadata: Arc::clone(&adapters.metadata),
    });
    set.register(ArchiveReviewable {
        metadata: Arc::clone(&adapters.metadata),
    });
    set.register(UpdateQualityScores {
        metadata: Arc::clone(&adapters.metadata),
    });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewableRef {
    pub tenant_id: String,
    pub reviewable_type: String,
    pub reviewable_id: String,
}

// =============================================================================
// publish_reviewable / archive_reviewable
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ReviewActionOutput {
    pub state: String,
}

pub struct PublishReviewable {
    pub metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl Activity for PublishReviewable {
    const TYPE: &'static str = "publish_reviewable";
    type Input = ReviewableRef;
    type Output = ReviewActionOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.metadata
            .upsert_document(
                &input.tenant_id,
                &input.reviewable_id,
                "PUBLISHED",
                json!({"reviewable_type": input.reviewable_type}),
            )
            .await?;

        Ok(ReviewActionOutput {
            state: "PUBLISHED".to_string(),
        })
    }
}

pub struct ArchiveReviewable {
    pub metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl Activity for ArchiveReviewable {
    const TYPE: &'static str = "archive_reviewable";
    type Input = ReviewableRef;
    type Output = ReviewActionOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.metadata
            .upsert_document(
                &input.tenant_id,
                &input.reviewable_id,
                "ARCHIVED",
                json!({"reviewable_type": input.reviewable_type}),
            )
            .await?;

        Ok(ReviewActionOutput {
            state: "ARCHIVED".to_string(),
        })
    }
}

// =============================================================================
// update_quality_scores
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateQualityScoresInput {
    pub tenant_id: String,
    pub reviewable_id: String,
    pub score: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateQualityScoresOutput {
    pub score: f64,
}

pub struct UpdateQualityScores {
    pub metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl Activity for UpdateQualityScores {
    const TYPE: &'static str = "update_quality_scores";
    type Input = UpdateQualityScoresInput;
    type Output = UpdateQualityScoresOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.metadata
            .update_quality_score(&input.tenant_id, &input.reviewable_id, input.score)
            .await?;

        Ok(UpdateQualityScoresOutput { score: input.score })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryMetadataStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn ctx() -> ActivityContext {
        ActivityContext::new(
            "review-r1",
            Uuid::now_v7(),
            "a-1",
            1,
            3,
            Utc::now() + chrono::Duration::seconds(300),
        )
    }

    #[tokio::test]
    async fn test_publish_and_archive() {
        let metadata = Arc::new(MemoryMetadataStore::new());

        let publish = PublishReviewable {
            metadata: metadata.clone(),
        };
        publish
            .execute(
                &ctx(),
                ReviewableRef {
                    tenant_id: "t".to_string(),
                    reviewable_type: "document".to_string(),
                    reviewable_id: "d1".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(metadata.document_state("t", "d1").as_deref(), Some("PUBLISHED"));

        let archive = ArchiveReviewable {
            metadata: metadata.clone(),
        };
        archive
            .execute(
                &ctx(),
                ReviewableRef {
                    tenant_id: "t".to_string(),
                    reviewable_type: "document".to_string(),
                    reviewable_id: "d1".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(metadata.document_state("t", "d1").as_deref(), Some("ARCHIVED"));
    }

    #[tokio::test]
    async fn test_quality_score_recorded() {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let activity = UpdateQualityScores {
            metadata: metadata.clone(),
        };

        activity
            .execute(
                &ctx(),
                UpdateQualityScoresInput {
                    tenant_id: "t".to_string(),
                    reviewable_id: "q1".to_string(),
                    score: 1.0,
                },
            )
            .await
            .unwrap();

        assert_eq!(metadata.quality_score("t", "q1"), Some(1.0));
    }
}
