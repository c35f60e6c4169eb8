//! Question-answering activities
//!
//! Retrieval (vector + graph), answer generation, confidence scoring,
//! review-task creation and answer persistence.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tessera_durable::{Activity, ActivityContext, ActivityError, ActivitySet};

use crate::adapters::llm::CompletionRequest;
use crate::adapters::{Adapters, GraphStore, LlmProvider, MetadataStore, VectorIndex};

/// Register every question-answering activity.
pub fn register(set: &mut ActivitySet, adapters: &Adapters) {
    set.register(VectorSearch {
        llm: Arc::clone(&adapters.llm),
        vectors: Arc::clone(&adapters.vectors),
    });
    set.register(GraphNeighbors {
        graph: Arc::clone(&adapters.graph),
    });
    set.register(GenerateAnswer {
        llm: Arc::clone(&adapters.llm),
    });
    set.register(ScoreConfidence {
        llm: Arc::clone(&adapters.llm),
    });
    set.register(CreateReviewTask {
        metadata: Arc::clone(&adapters.metadata),
    });
    set.register(PersistAnswer {
        metadata: Arc::clone(&adapters.metadata),
    });
}

// =============================================================================
// vector_search
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchInput {
    pub tenant_id: String,
    pub question_text: String,
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub score: f32,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VectorSearchOutput {
    pub hits: Vec<RetrievedChunk>,
}

pub struct VectorSearch {
    pub llm: Arc<dyn LlmProvider>,
    pub vectors: Arc<dyn VectorIndex>,
}

#[async_trait]
impl Activity for VectorSearch {
    const TYPE: &'static str = "vector_search";
    type Input = VectorSearchInput;
    type Output = VectorSearchOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let embedded = self.llm.embed(&[input.question_text.clone()]).await?;
        let query = embedded
            .into_iter()
            .next()
            .ok_or_else(|| ActivityError::retryable("embedding provider returned no vector"))?;

        let hits = self
            .vectors
            .search(&input.tenant_id, &query, input.k)
            .await?;

        Ok(VectorSearchOutput {
            hits: hits
                .into_iter()
                .map(|hit| RetrievedChunk {
                    id: hit.id,
                    score: hit.score,
                    text: hit.metadata["text"].as_str().unwrap_or_default().to_string(),
                })
                .collect(),
        })
    }
}

// =============================================================================
// graph_neighbors
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNeighborsInput {
    pub tenant_id: String,
    pub seed: String,
    #[serde(default = "default_k")]
    pub limit: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphNeighborsOutput {
    pub neighbors: Vec<crate::adapters::GraphEntity>,
}

pub struct GraphNeighbors {
    pub graph: Arc<dyn GraphStore>,
}

#[async_trait]
impl Activity for GraphNeighbors {
    const TYPE: &'static str = "graph_neighbors";
    type Input = GraphNeighborsInput;
    type Output = GraphNeighborsOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let neighbors = self
            .graph
            .neighbors(&input.tenant_id, &input.seed, input.limit)
            .await?;

        Ok(GraphNeighborsOutput { neighbors })
    }
}

// =============================================================================
// generate_answer
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateAnswerInput {
    pub question_id: String,
    pub question_text: String,
    #[serde(default)]
    pub context: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateAnswerOutput {
    pub answer: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub struct GenerateAnswer {
    pub llm: Arc<dyn LlmProvider>,
}

#[async_trait]
impl Activity for GenerateAnswer {
    const TYPE: &'static str = "generate_answer";
    type Input = GenerateAnswerInput;
    type Output = GenerateAnswerOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let context = if input.context.is_empty() {
            "(no retrieved context)".to_string()
        } else {
            input.context.join("\n---\n")
        };

        let prompt = format!(
            "Answer the question using only the provided context.\n\n\
             Context:\n{context}\n\nQuestion: {}",
            input.question_text
        );

        let completion = self
            .llm
            .complete(
                CompletionRequest::new(prompt)
                    .with_cache_key(format!("answer:{}", input.question_id)),
            )
            .await?;

        Ok(GenerateAnswerOutput {
            answer: completion.text,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        })
    }
}

// =============================================================================
// score_confidence
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreConfidenceInput {
    pub question_id: String,
    pub question_text: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreConfidenceOutput {
    pub confidence: f64,
}

pub struct ScoreConfidence {
    pub llm: Arc<dyn LlmProvider>,
}

#[async_trait]
impl Activity for ScoreConfidence {
    const TYPE: &'static str = "score_confidence";
    type Input = ScoreConfidenceInput;
    type Output = ScoreConfidenceOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let prompt = format!(
            "How confident are you that this answer is correct and grounded? \
             Respond with JSON: {{\"confidence\": <0.0-1.0>}}.\n\n\
             Question: {}\nAnswer: {}",
            input.question_text, input.answer
        );

        let completion = self
            .llm
            .complete(
                CompletionRequest::new(prompt)
                    .with_cache_key(format!("confidence:{}", input.question_id)),
            )
            .await?;

        let parsed: ScoreConfidenceOutput = serde_json::from_str(completion.text.trim())
            .map_err(|e| ActivityError::retryable(format!("unparseable confidence score: {e}")))?;

        Ok(ScoreConfidenceOutput {
            confidence: parsed.confidence.clamp(0.0, 1.0),
        })
    }
}

// =============================================================================
// create_review_task
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReviewTaskInput {
    pub tenant_id: String,
    pub review_id: String,
    pub reviewable_type: String,
    pub reviewable_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateReviewTaskOutput {
    pub review_id: String,
}

pub struct CreateReviewTask {
    pub metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl Activity for CreateReviewTask {
    const TYPE: &'static str = "create_review_task";
    type Input = CreateReviewTaskInput;
    type Output = CreateReviewTaskOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.metadata
            .create_review(
                &input.tenant_id,
                &input.review_id,
                &input.reviewable_type,
                &input.reviewable_id,
            )
            .await?;

        Ok(CreateReviewTaskOutput {
            review_id: input.review_id,
        })
    }
}

// =============================================================================
// persist_answer
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistAnswerInput {
    pub tenant_id: String,
    pub question_id: String,
    pub answer: String,
    pub confidence: f64,
    #[serde(default)]
    pub review_status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistAnswerOutput {
    pub persisted: bool,
}

pub struct PersistAnswer {
    pub metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl Activity for PersistAnswer {
    const TYPE: &'static str = "persist_answer";
    type Input = PersistAnswerInput;
    type Output = PersistAnswerOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.metadata
            .upsert_answer(
                &input.tenant_id,
                &input.question_id,
                json!({
                    "answer": input.answer,
                    "confidence": input.confidence,
                    "review_status": input.review_status,
                }),
            )
            .await?;

        Ok(PersistAnswerOutput { persisted: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeLlm, MemoryVectorIndex, VectorPoint};
    use chrono::Utc;
    use uuid::Uuid;

    fn ctx() -> ActivityContext {
        ActivityContext::new(
            "qa-q1",
            Uuid::now_v7(),
            "a-1",
            1,
            3,
            Utc::now() + chrono::Duration::seconds(300),
        )
    }

    #[tokio::test]
    async fn test_vector_search_returns_chunk_text() {
        let llm = Arc::new(FakeLlm::new());
        let vectors = Arc::new(MemoryVectorIndex::new());

        // Seed with the same embedding function the fake uses for queries.
        let seeded = llm.embed(&["rust is fast".to_string()]).await.unwrap();
        vectors
            .upsert(
                "t",
                VectorPoint {
                    id: "d1:0".to_string(),
                    vector: seeded[0].clone(),
                    metadata: json!({"text": "rust is fast", "document_id": "d1"}),
                },
            )
            .await
            .unwrap();

        let activity = VectorSearch { llm, vectors };
        let output = activity
            .execute(
                &ctx(),
                VectorSearchInput {
                    tenant_id: "t".to_string(),
                    question_text: "rust is fast".to_string(),
                    k: 3,
                },
            )
            .await
            .unwrap();

        assert_eq!(output.hits.len(), 1);
        assert_eq!(output.hits[0].text, "rust is fast");
        assert!(output.hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_score_confidence_clamps() {
        let llm = Arc::new(FakeLlm::new());
        llm.script(r#"{"confidence": 1.7}"#);

        let activity = ScoreConfidence { llm };
        let output = activity
            .execute(
                &ctx(),
                ScoreConfidenceInput {
                    question_id: "q1".to_string(),
                    question_text: "?".to_string(),
                    answer: "!".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(output.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_generate_answer_includes_context() {
        let llm = Arc::new(FakeLlm::new());
        let activity = GenerateAnswer { llm };

        // The fake echoes the prompt; the context must appear in it.
        let output = activity
            .execute(
                &ctx(),
                GenerateAnswerInput {
                    question_id: "q1".to_string(),
                    question_text: "what is tessera?".to_string(),
                    context: vec!["tessera is a workflow engine".to_string()],
                },
            )
            .await
            .unwrap();

        assert!(output.answer.contains("tessera is a workflow engine"));
        assert!(output.answer.contains("what is tessera?"));
    }
}
