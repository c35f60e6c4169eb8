//! Egress adapter ports
//!
//! Each external system the activities touch is a trait with an in-memory
//! implementation for tests and local development. Adapter values are
//! explicit: constructed at process start and injected into activities, never
//! reached through globals.

pub mod blob;
pub mod graph;
pub mod llm;
pub mod metadata;
pub mod notify;
pub mod vector;

use std::sync::Arc;

use tessera_durable::ActivityError;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use graph::{GraphEntity, GraphRelation, GraphStore, MemoryGraphStore};
pub use llm::{Completion, CompletionRequest, FakeLlm, LlmProvider, OpenAiCompatProvider};
pub use metadata::{DocumentRow, MemoryMetadataStore, MetadataStore};
pub use notify::{FanoutNotifier, MemoryNotifier, Notifier};
pub use vector::{MemoryVectorIndex, ScoredPoint, VectorIndex, VectorPoint};

/// Errors surfaced by egress adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient upstream failure; safe to retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent failure; retrying will not help.
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl From<AdapterError> for ActivityError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::NotFound(msg) => {
                ActivityError::non_retryable(msg).with_type("NotFound")
            }
            AdapterError::Transient(msg) => {
                ActivityError::retryable(msg).with_type("Transient")
            }
            AdapterError::Permanent(msg) => {
                ActivityError::non_retryable(msg).with_type("Permanent")
            }
        }
    }
}

/// The adapter bundle handed to activity registration.
#[derive(Clone)]
pub struct Adapters {
    pub blobs: Arc<dyn BlobStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub graph: Arc<dyn GraphStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub metadata: Arc<dyn MetadataStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl Adapters {
    /// A fully in-memory bundle for tests and local development.
    pub fn in_memory() -> Self {
        Self {
            blobs: Arc::new(MemoryBlobStore::new()),
            vectors: Arc::new(MemoryVectorIndex::new()),
            graph: Arc::new(MemoryGraphStore::new()),
            llm: Arc::new(FakeLlm::new()),
            metadata: Arc::new(MemoryMetadataStore::new()),
            notifier: Arc::new(MemoryNotifier::new()),
        }
    }
}
