//! Document-ingestion activities
//!
//! The pipeline behind the document-processing workflow: download, extract
//! and chunk, assess relevance, embed, extract graph entities, publish to
//! the vector and graph stores, compensating deletes, metadata updates and
//! stakeholder notification.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use tessera_durable::persistence::InboxKind;
use tessera_durable::{Activity, ActivityContext, ActivityError, ActivitySet};

use crate::adapters::{
    Adapters, BlobStore, GraphEntity, GraphRelation, GraphStore, LlmProvider, MetadataStore,
    Notifier, VectorIndex, VectorPoint,
};
use crate::adapters::llm::CompletionRequest;

/// Target chunk size in characters; chunks break at the nearest whitespace.
const CHUNK_SIZE: usize = 1200;

/// Prompt budget for assessment/extraction calls.
const PROMPT_BUDGET: usize = 4000;

/// Truncate without splitting a UTF-8 code point.
fn prompt_excerpt(text: &str) -> &str {
    if text.len() <= PROMPT_BUDGET {
        return text;
    }
    let mut end = PROMPT_BUDGET;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Register every ingestion activity.
pub fn register(set: &mut ActivitySet, adapters: &Adapters) {
    set.register(DownloadBlob {
        blobs: Arc::clone(&adapters.blobs),
    });
    set.register(ExtractTextAndChunk);
    set.register(AssessRelevance {
        llm: Arc::clone(&adapters.llm),
    });
    set.register(GenerateEmbeddings {
        llm: Arc::clone(&adapters.llm),
    });
    set.register(ExtractGraphEntities {
        llm: Arc::clone(&adapters.llm),
    });
    set.register(UpsertVectorIndex {
        vectors: Arc::clone(&adapters.vectors),
    });
    set.register(UpsertGraph {
        graph: Arc::clone(&adapters.graph),
    });
    set.register(DeleteFromVectorIndex {
        vectors: Arc::clone(&adapters.vectors),
    });
    set.register(DeleteFromGraph {
        graph: Arc::clone(&adapters.graph),
    });
    set.register(ArchiveDocument {
        metadata: Arc::clone(&adapters.metadata),
    });
    set.register(UpdateMetadata {
        metadata: Arc::clone(&adapters.metadata),
    });
    set.register(NotifyStakeholders {
        notifier: Arc::clone(&adapters.notifier),
    });
}

// =============================================================================
// download_blob
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadBlobInput {
    pub blob_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadBlobOutput {
    pub content: String,
    pub size_bytes: u64,
}

pub struct DownloadBlob {
    pub blobs: Arc<dyn BlobStore>,
}

#[async_trait]
impl Activity for DownloadBlob {
    const TYPE: &'static str = "download_blob";
    type Input = DownloadBlobInput;
    type Output = DownloadBlobOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let bytes = self.blobs.get(&input.blob_path).await?;
        let size_bytes = bytes.len() as u64;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        Ok(DownloadBlobOutput {
            content,
            size_bytes,
        })
    }
}

// =============================================================================
// extract_text_and_chunk
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractInput {
    pub document_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractOutput {
    pub text: String,
    pub detected_type: String,
    pub chunks: Vec<Chunk>,
}

pub struct ExtractTextAndChunk;

fn detect_type(content: &str) -> &'static str {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        "json"
    } else if trimmed.starts_with('#') || content.contains("\n## ") {
        "markdown"
    } else if trimmed.starts_with('<') {
        "html"
    } else {
        "text"
    }
}

fn chunk_text(text: &str) -> Vec<Chunk> {
    let mut chunks = vec![];
    let mut rest = text;
    let mut index = 0u32;

    while !rest.is_empty() {
        let mut end = CHUNK_SIZE.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        // Break at whitespace when possible so words stay intact.
        if end < rest.len() {
            if let Some(ws) = rest[..end].rfind(char::is_whitespace) {
                if ws > 0 {
                    end = ws;
                }
            }
        }

        let piece = rest[..end].trim();
        if !piece.is_empty() {
            chunks.push(Chunk {
                index,
                text: piece.to_string(),
            });
            index += 1;
        }
        rest = rest[end..].trim_start();
    }

    chunks
}

#[async_trait]
impl Activity for ExtractTextAndChunk {
    const TYPE: &'static str = "extract_text_and_chunk";
    type Input = ExtractInput;
    type Output = ExtractOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        if input.content.trim().is_empty() {
            return Err(ActivityError::non_retryable(format!(
                "document {} has no extractable text",
                input.document_id
            )));
        }

        let detected_type = detect_type(&input.content).to_string();
        let text = input.content;
        let chunks = chunk_text(&text);

        Ok(ExtractOutput {
            text,
            detected_type,
            chunks,
        })
    }
}

// =============================================================================
// assess_relevance
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessInput {
    pub document_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessOutput {
    pub score: f64,
    pub rationale: String,
}

pub struct AssessRelevance {
    pub llm: Arc<dyn LlmProvider>,
}

#[async_trait]
impl Activity for AssessRelevance {
    const TYPE: &'static str = "assess_relevance";
    type Input = AssessInput;
    type Output = AssessOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let prompt = format!(
            "Rate the relevance of the following document to the knowledge base on a \
             0-10 scale. Respond with JSON: {{\"score\": <number>, \"rationale\": <string>}}.\n\n{}",
            prompt_excerpt(&input.text)
        );

        let completion = self
            .llm
            .complete(
                CompletionRequest::new(prompt)
                    .with_cache_key(format!("assess:{}", input.document_id)),
            )
            .await?;

        let parsed: AssessOutput = serde_json::from_str(completion.text.trim()).map_err(|e| {
            ActivityError::retryable(format!("unparseable relevance assessment: {e}"))
        })?;

        info!(
            document_id = %input.document_id,
            score = parsed.score,
            "relevance assessed"
        );

        Ok(AssessOutput {
            score: parsed.score.clamp(0.0, 10.0),
            rationale: parsed.rationale,
        })
    }
}

// =============================================================================
// generate_embeddings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedInput {
    pub tenant_id: String,
    pub document_id: String,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub index: u32,
    pub vector: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbedOutput {
    pub count: u32,
    pub vectors: Vec<EmbeddedChunk>,
}

pub struct GenerateEmbeddings {
    pub llm: Arc<dyn LlmProvider>,
}

const EMBED_BATCH: usize = 16;

#[async_trait]
impl Activity for GenerateEmbeddings {
    const TYPE: &'static str = "generate_embeddings";
    type Input = EmbedInput;
    type Output = EmbedOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let mut vectors = Vec::with_capacity(input.chunks.len());

        for batch in input.chunks.chunks(EMBED_BATCH) {
            if ctx.is_cancelled() {
                return Err(ActivityError::cancelled("embedding cancelled"));
            }

            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedded = self.llm.embed(&texts).await?;

            for (chunk, vector) in batch.iter().zip(embedded) {
                vectors.push(EmbeddedChunk {
                    index: chunk.index,
                    vector,
                });
            }

            // Long-running for large documents; renew the lease per batch.
            let _ = ctx
                .heartbeat(Some(json!({"embedded": vectors.len()})))
                .await;
        }

        Ok(EmbedOutput {
            count: vectors.len() as u32,
            vectors,
        })
    }
}

// =============================================================================
// extract_graph_entities
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractEntitiesInput {
    pub tenant_id: String,
    pub document_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractEntitiesOutput {
    pub entities: Vec<GraphEntity>,
    pub relations: Vec<GraphRelation>,
}

pub struct ExtractGraphEntities {
    pub llm: Arc<dyn LlmProvider>,
}

#[async_trait]
impl Activity for ExtractGraphEntities {
    const TYPE: &'static str = "extract_graph_entities";
    type Input = ExtractEntitiesInput;
    type Output = ExtractEntitiesOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let prompt = format!(
            "Extract the entities and relations from this document as JSON: \
             {{\"entities\": [{{\"id\", \"label\", \"properties\"}}], \
             \"relations\": [{{\"from\", \"to\", \"kind\"}}]}}.\n\n{}",
            prompt_excerpt(&input.text)
        );

        let completion = self
            .llm
            .complete(
                CompletionRequest::new(prompt)
                    .with_cache_key(format!("entities:{}", input.document_id)),
            )
            .await?;

        let parsed: ExtractEntitiesOutput = serde_json::from_str(completion.text.trim())
            .map_err(|e| ActivityError::retryable(format!("unparseable entity extraction: {e}")))?;

        Ok(parsed)
    }
}

// =============================================================================
// upsert_vector_index / delete_from_vector_index
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertVectorsInput {
    pub tenant_id: String,
    pub document_id: String,
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<EmbeddedChunk>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpsertVectorsOutput {
    pub points_written: u32,
}

pub struct UpsertVectorIndex {
    pub vectors: Arc<dyn VectorIndex>,
}

#[async_trait]
impl Activity for UpsertVectorIndex {
    const TYPE: &'static str = "upsert_vector_index";
    type Input = UpsertVectorsInput;
    type Output = UpsertVectorsOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let mut written = 0u32;

        for embedded in &input.vectors {
            let text = input
                .chunks
                .iter()
                .find(|c| c.index == embedded.index)
                .map(|c| c.text.clone())
                .unwrap_or_default();

            self.vectors
                .upsert(
                    &input.tenant_id,
                    VectorPoint {
                        id: format!("{}:{}", input.document_id, embedded.index),
                        vector: embedded.vector.clone(),
                        metadata: json!({
                            "document_id": input.document_id,
                            "chunk_index": embedded.index,
                            "text": text,
                        }),
                    },
                )
                .await?;
            written += 1;
        }

        Ok(UpsertVectorsOutput {
            points_written: written,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteVectorsInput {
    pub tenant_id: String,
    pub document_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteVectorsOutput {
    pub deleted: bool,
}

pub struct DeleteFromVectorIndex {
    pub vectors: Arc<dyn VectorIndex>,
}

#[async_trait]
impl Activity for DeleteFromVectorIndex {
    const TYPE: &'static str = "delete_from_vector_index";
    type Input = DeleteVectorsInput;
    type Output = DeleteVectorsOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.vectors
            .delete(&input.tenant_id, &input.document_id)
            .await?;
        Ok(DeleteVectorsOutput { deleted: true })
    }
}

// =============================================================================
// upsert_graph / delete_from_graph
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertGraphInput {
    pub tenant_id: String,
    pub document_id: String,
    pub entities: Vec<GraphEntity>,
    pub relations: Vec<GraphRelation>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpsertGraphOutput {
    pub entities_written: u32,
    pub relations_written: u32,
}

pub struct UpsertGraph {
    pub graph: Arc<dyn GraphStore>,
}

#[async_trait]
impl Activity for UpsertGraph {
    const TYPE: &'static str = "upsert_graph";
    type Input = UpsertGraphInput;
    type Output = UpsertGraphOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.graph
            .merge_document(
                &input.tenant_id,
                &input.document_id,
                &input.entities,
                &input.relations,
            )
            .await?;

        Ok(UpsertGraphOutput {
            entities_written: input.entities.len() as u32,
            relations_written: input.relations.len() as u32,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteGraphInput {
    pub tenant_id: String,
    pub document_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteGraphOutput {
    pub deleted: bool,
}

pub struct DeleteFromGraph {
    pub graph: Arc<dyn GraphStore>,
}

#[async_trait]
impl Activity for DeleteFromGraph {
    const TYPE: &'static str = "delete_from_graph";
    type Input = DeleteGraphInput;
    type Output = DeleteGraphOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.graph
            .delete_document(&input.tenant_id, &input.document_id)
            .await?;
        Ok(DeleteGraphOutput { deleted: true })
    }
}

// =============================================================================
// archive_document / update_metadata
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveDocumentInput {
    pub tenant_id: String,
    pub document_id: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveDocumentOutput {
    pub archived: bool,
}

pub struct ArchiveDocument {
    pub metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl Activity for ArchiveDocument {
    const TYPE: &'static str = "archive_document";
    type Input = ArchiveDocumentInput;
    type Output = ArchiveDocumentOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.metadata
            .upsert_document(
                &input.tenant_id,
                &input.document_id,
                "ARCHIVED",
                json!({"reason": input.reason}),
            )
            .await?;
        Ok(ArchiveDocumentOutput { archived: true })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMetadataInput {
    pub tenant_id: String,
    pub document_id: String,
    pub state: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateMetadataOutput {
    pub state: String,
}

pub struct UpdateMetadata {
    pub metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl Activity for UpdateMetadata {
    const TYPE: &'static str = "update_metadata";
    type Input = UpdateMetadataInput;
    type Output = UpdateMetadataOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.metadata
            .upsert_document(
                &input.tenant_id,
                &input.document_id,
                &input.state,
                input.extra,
            )
            .await?;
        Ok(UpdateMetadataOutput { state: input.state })
    }
}

// =============================================================================
// notify_stakeholders
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyInput {
    pub principal: String,
    pub workflow_id: String,
    pub kind: InboxKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotifyOutput {
    pub delivered: bool,
}

pub struct NotifyStakeholders {
    pub notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl Activity for NotifyStakeholders {
    const TYPE: &'static str = "notify_stakeholders";
    type Input = NotifyInput;
    type Output = NotifyOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.notifier
            .notify(
                &input.principal,
                &input.workflow_id,
                input.kind,
                input.payload,
            )
            .await?;
        Ok(NotifyOutput { delivered: true })
    }
}
