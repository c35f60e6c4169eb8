//! Workflow definitions and activity library for the knowledge platform.
//!
//! Three state machines run on the durable engine:
//! - [`document::DocumentProcessingWorkflow`]: ingest a document: download,
//!   extract, assess relevance, optionally wait for a human decision, embed
//!   and graph in parallel, publish with compensation on partial failure.
//! - [`answer::QuestionAnsweringWorkflow`]: retrieve context, generate and
//!   score an answer, spawn a quality review below the confidence bar.
//! - [`review::QualityReviewWorkflow`]: a reviewable suspended on a
//!   `review_decision` signal; applies publish/archive/rollback.
//!
//! Activities talk to external systems through the adapter ports in
//! [`adapters`]; adapter values are constructed once at process start and
//! injected into the activity registration table.

pub mod activities;
pub mod adapters;
pub mod answer;
pub mod document;
pub mod review;

use tessera_durable::{ActivitySet, WorkflowExecutor};

use adapters::Adapters;

/// Workflow type names as registered with the engine.
pub mod workflow_types {
    pub const DOCUMENT_PROCESSING: &str = "document_processing";
    pub const QUESTION_ANSWERING: &str = "question_answering";
    pub const QUALITY_REVIEW: &str = "quality_review";
}

/// Signal channel names the workflows await on.
pub mod signal_names {
    /// Human decision for a document pending review.
    pub const CONTROLLER_DECISION: &str = "controller_decision";

    /// Human decision for a quality review.
    pub const REVIEW_DECISION: &str = "review_decision";
}

/// Register every workflow definition with an executor.
pub fn register_workflows(executor: &mut WorkflowExecutor) {
    executor.register::<document::DocumentProcessingWorkflow>();
    executor.register::<answer::QuestionAnsweringWorkflow>();
    executor.register::<review::QualityReviewWorkflow>();
}

/// Build the full activity registration table over a set of adapters.
pub fn activity_set(adapters: &Adapters) -> ActivitySet {
    let mut set = ActivitySet::new();
    activities::ingest::register(&mut set, adapters);
    activities::answer::register(&mut set, adapters);
    activities::review::register(&mut set, adapters);
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_set_covers_pipeline() {
        let adapters = Adapters::in_memory();
        let set = activity_set(&adapters);

        for activity_type in [
            "download_blob",
            "extract_text_and_chunk",
            "assess_relevance",
            "generate_embeddings",
            "extract_graph_entities",
            "upsert_vector_index",
            "upsert_graph",
            "delete_from_vector_index",
            "delete_from_graph",
            "archive_document",
            "update_metadata",
            "notify_stakeholders",
            "vector_search",
            "graph_neighbors",
            "generate_answer",
            "score_confidence",
            "create_review_task",
            "persist_answer",
            "publish_reviewable",
            "archive_reviewable",
            "update_quality_scores",
        ] {
            assert!(set.contains(activity_type), "missing {activity_type}");
        }
    }
}
