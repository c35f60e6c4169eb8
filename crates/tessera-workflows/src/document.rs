//! Document-processing workflow
//!
//! INITIAL → DOWNLOADING → EXTRACTING → ASSESSING →
//! (AUTO_APPROVED | PENDING_REVIEW | AUTO_REJECTED) →
//! (EMBEDDING ∥ GRAPHING) → PUBLISHING → METADATA → NOTIFY →
//! PUBLISHED | ARCHIVED.
//!
//! Relevance branching: at or above the auto-approve threshold the document
//! proceeds unattended; strictly below the relevance threshold it is
//! auto-rejected; in between it is parked for human review with indexed
//! search attributes and a deadline. One deadline miss escalates the
//! priority and re-arms the timer; a second miss auto-rejects.
//!
//! Publishing schedules the vector and graph upserts in parallel; if exactly
//! one of them fails permanently, the successful one is rolled back with a
//! compensating delete before the workflow fails.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use tessera_durable::persistence::InboxKind;
use tessera_durable::workflow::attributes::{keys, AttributeMap, AttributeValue};
use tessera_durable::workflow::{ReviewDecision, ReviewVerdict};
use tessera_durable::{
    ActivityError, ActivityOptions, Decision, RetryPolicy, Signal, TaskQueue, Workflow,
    WorkflowContext, WorkflowError,
};

use crate::activities::ingest::{
    AssessOutput, Chunk, DownloadBlobOutput, EmbedOutput, EmbeddedChunk, ExtractEntitiesOutput,
    ExtractOutput,
};
use crate::adapters::{GraphEntity, GraphRelation};
use crate::signal_names;

/// Review-queue attribute values for documents.
const REVIEW_QUEUE: &str = "document-review";

/// Thresholds and deadline governing the relevance branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPolicy {
    #[serde(default = "default_auto_approve")]
    pub auto_approve_threshold: f64,

    #[serde(default = "default_relevance")]
    pub relevance_threshold: f64,

    /// Review deadline in milliseconds; applied twice (initial + escalated).
    #[serde(default = "default_deadline_ms")]
    pub review_deadline_ms: u64,
}

fn default_auto_approve() -> f64 {
    8.0
}

fn default_relevance() -> f64 {
    5.0
}

fn default_deadline_ms() -> u64 {
    24 * 60 * 60 * 1000
}

impl Default for DocumentPolicy {
    fn default() -> Self {
        Self {
            auto_approve_threshold: default_auto_approve(),
            relevance_threshold: default_relevance(),
            review_deadline_ms: default_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    pub document_id: String,
    pub tenant_id: String,
    pub blob_path: String,
    /// Principal of the contributor; notified on completion.
    pub contributor: String,
    #[serde(default)]
    pub policy: DocumentPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub state: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Downloading,
    Extracting,
    Assessing,
    AwaitingReview,
    Enriching,
    Publishing,
    Compensating,
    Archiving,
    RecordingOutcome,
    Notifying,
    Done,
}

pub struct DocumentProcessingWorkflow {
    input: DocumentInput,
    stage: Stage,

    text: String,
    chunks: Vec<Chunk>,
    score: f64,
    decided_by: Option<String>,
    reason: Option<String>,
    escalated: bool,

    vectors: Vec<EmbeddedChunk>,
    entities: Vec<GraphEntity>,
    relations: Vec<GraphRelation>,
    embed_done: bool,
    graph_extract_done: bool,

    /// Publish results: None = in flight, Some(true/false) = resolved.
    vector_ok: Option<bool>,
    graph_ok: Option<bool>,

    outcome_state: &'static str,
    error: Option<WorkflowError>,
    finished: bool,
}

fn ai_options() -> ActivityOptions {
    ActivityOptions::default()
        .with_retry(
            RetryPolicy::exponential()
                .with_max_attempts(4)
                .with_initial_interval(Duration::from_millis(500)),
        )
        .with_start_to_close_timeout(Duration::from_secs(600))
        .with_heartbeat(Duration::from_secs(60))
}

fn storage_options() -> ActivityOptions {
    ActivityOptions::default().with_retry(
        RetryPolicy::exponential()
            .with_max_attempts(4)
            .with_initial_interval(Duration::from_millis(250)),
    )
}

fn download_options() -> ActivityOptions {
    ActivityOptions::default()
        .with_retry(RetryPolicy::exponential().with_max_attempts(3))
        .with_schedule_to_close_timeout(Duration::from_secs(300))
}

impl DocumentProcessingWorkflow {
    fn parse<T: serde::de::DeserializeOwned>(
        &mut self,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Result<T, Vec<Decision>> {
        serde_json::from_value(result).map_err(|e| {
            self.fail(WorkflowError::new(format!(
                "unexpected result shape from {activity_id}: {e}"
            )))
        })
    }

    fn fail(&mut self, error: WorkflowError) -> Vec<Decision> {
        self.finished = true;
        self.error = Some(error.clone());
        vec![Decision::fail(error)]
    }

    fn review_attributes(&self, ctx: &WorkflowContext, priority: &str) -> AttributeMap {
        let deadline = chrono::Duration::milliseconds(self.input.policy.review_deadline_ms as i64);
        let mut attrs = AttributeMap::new();
        attrs.insert(keys::ASSIGNEE.into(), AttributeValue::text("controller"));
        attrs.insert(keys::QUEUE.into(), AttributeValue::text(REVIEW_QUEUE));
        attrs.insert(keys::STATUS.into(), AttributeValue::text("pending"));
        attrs.insert(keys::PRIORITY.into(), AttributeValue::text(priority));
        attrs.insert(keys::DUE_AT.into(), AttributeValue::time(ctx.now() + deadline));
        attrs.insert(
            keys::TENANT.into(),
            AttributeValue::text(&*self.input.tenant_id),
        );
        attrs.insert(
            keys::DOCUMENT_ID.into(),
            AttributeValue::text(&*self.input.document_id),
        );
        attrs.insert(
            keys::CONTRIBUTOR_ID.into(),
            AttributeValue::text(&*self.input.contributor),
        );
        attrs.insert(
            keys::RELEVANCE_SCORE.into(),
            AttributeValue::number(self.score),
        );
        attrs
    }

    fn enter_enrichment(&mut self) -> Vec<Decision> {
        self.stage = Stage::Enriching;
        vec![
            Decision::schedule_activity_with(
                "embed",
                "generate_embeddings",
                json!({
                    "tenant_id": self.input.tenant_id,
                    "document_id": self.input.document_id,
                    "chunks": self.chunks,
                }),
                ai_options(),
            ),
            Decision::schedule_activity_with(
                "graph-extract",
                "extract_graph_entities",
                json!({
                    "tenant_id": self.input.tenant_id,
                    "document_id": self.input.document_id,
                    "text": self.text,
                }),
                ai_options(),
            ),
        ]
    }

    fn maybe_enter_publishing(&mut self) -> Vec<Decision> {
        if !(self.embed_done && self.graph_extract_done) {
            return vec![];
        }

        self.stage = Stage::Publishing;
        vec![
            Decision::schedule_activity_with(
                "vector-upsert",
                "upsert_vector_index",
                json!({
                    "tenant_id": self.input.tenant_id,
                    "document_id": self.input.document_id,
                    "chunks": self.chunks,
                    "vectors": self.vectors,
                }),
                storage_options(),
            ),
            Decision::schedule_activity_with(
                "graph-upsert",
                "upsert_graph",
                json!({
                    "tenant_id": self.input.tenant_id,
                    "document_id": self.input.document_id,
                    "entities": self.entities,
                    "relations": self.relations,
                }),
                storage_options(),
            ),
        ]
    }

    /// Once both publish writes are resolved: proceed, compensate, or fail.
    fn resolve_publishing(&mut self) -> Vec<Decision> {
        match (self.vector_ok, self.graph_ok) {
            (Some(true), Some(true)) => self.enter_metadata("PUBLISHED"),
            (Some(true), Some(false)) => {
                self.stage = Stage::Compensating;
                vec![Decision::schedule_activity_with(
                    "vector-delete",
                    "delete_from_vector_index",
                    json!({
                        "tenant_id": self.input.tenant_id,
                        "document_id": self.input.document_id,
                    }),
                    storage_options(),
                )]
            }
            (Some(false), Some(true)) => {
                self.stage = Stage::Compensating;
                vec![Decision::schedule_activity_with(
                    "graph-delete",
                    "delete_from_graph",
                    json!({
                        "tenant_id": self.input.tenant_id,
                        "document_id": self.input.document_id,
                    }),
                    storage_options(),
                )]
            }
            (Some(false), Some(false)) => self.fail(
                WorkflowError::new("vector and graph publish both failed")
                    .with_code("publish_failed"),
            ),
            _ => vec![],
        }
    }

    fn enter_archiving(&mut self, reason: &str) -> Vec<Decision> {
        self.stage = Stage::Archiving;
        self.outcome_state = "ARCHIVED";
        self.reason = Some(reason.to_string());
        vec![Decision::schedule_activity(
            "archive",
            "archive_document",
            json!({
                "tenant_id": self.input.tenant_id,
                "document_id": self.input.document_id,
                "reason": reason,
            }),
        )]
    }

    fn enter_metadata(&mut self, state: &'static str) -> Vec<Decision> {
        self.stage = Stage::RecordingOutcome;
        self.outcome_state = state;
        vec![Decision::schedule_activity_with(
            "metadata",
            "update_metadata",
            json!({
                "tenant_id": self.input.tenant_id,
                "document_id": self.input.document_id,
                "state": state,
                "extra": {"reason": self.reason},
            }),
            storage_options(),
        )]
    }

    fn enter_notifying(&mut self) -> Vec<Decision> {
        self.stage = Stage::Notifying;
        vec![Decision::schedule_activity(
            "notify",
            "notify_stakeholders",
            json!({
                "principal": self.input.contributor,
                "workflow_id": self.input.document_id,
                "kind": InboxKind::Completion,
                "payload": {
                    "document_id": self.input.document_id,
                    "state": self.outcome_state,
                    "reason": self.reason,
                },
            }),
        )]
    }

    fn complete(&mut self) -> Vec<Decision> {
        self.stage = Stage::Done;
        self.finished = true;
        let outcome = DocumentOutcome {
            state: self.outcome_state.to_string(),
            decided_by: self.decided_by.clone(),
            reason: self.reason.clone(),
        };
        vec![Decision::complete(
            serde_json::to_value(outcome).unwrap_or(serde_json::Value::Null),
        )]
    }
}

impl Workflow for DocumentProcessingWorkflow {
    const TYPE: &'static str = "document_processing";
    type Input = DocumentInput;
    type Output = DocumentOutcome;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            stage: Stage::Downloading,
            text: String::new(),
            chunks: vec![],
            score: 0.0,
            decided_by: None,
            reason: None,
            escalated: false,
            vectors: vec![],
            entities: vec![],
            relations: vec![],
            embed_done: false,
            graph_extract_done: false,
            vector_ok: None,
            graph_ok: None,
            outcome_state: "PUBLISHED",
            error: None,
            finished: false,
        }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<Decision> {
        vec![Decision::schedule_activity_with(
            "download",
            "download_blob",
            json!({"blob_path": self.input.blob_path}),
            download_options(),
        )
        .on_queue(TaskQueue::Storage)]
    }

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<Decision> {
        match (self.stage, activity_id) {
            (Stage::Downloading, "download") => {
                let download: DownloadBlobOutput = match self.parse(activity_id, result) {
                    Ok(v) => v,
                    Err(decisions) => return decisions,
                };
                self.stage = Stage::Extracting;
                vec![Decision::schedule_activity_with(
                    "extract",
                    "extract_text_and_chunk",
                    json!({
                        "document_id": self.input.document_id,
                        "content": download.content,
                    }),
                    ai_options(),
                )]
            }

            (Stage::Extracting, "extract") => {
                let extract: ExtractOutput = match self.parse(activity_id, result) {
                    Ok(v) => v,
                    Err(decisions) => return decisions,
                };
                self.text = extract.text;
                self.chunks = extract.chunks;
                self.stage = Stage::Assessing;
                vec![Decision::schedule_activity_with(
                    "assess",
                    "assess_relevance",
                    json!({
                        "document_id": self.input.document_id,
                        "text": self.text,
                    }),
                    ai_options(),
                )]
            }

            (Stage::Assessing, "assess") => {
                let assessment: AssessOutput = match self.parse(activity_id, result) {
                    Ok(v) => v,
                    Err(decisions) => return decisions,
                };
                self.score = assessment.score;

                if self.score >= self.input.policy.auto_approve_threshold {
                    self.enter_enrichment()
                } else if self.score < self.input.policy.relevance_threshold {
                    self.enter_archiving("auto_rejected")
                } else {
                    self.stage = Stage::AwaitingReview;
                    vec![
                        Decision::upsert_attributes(self.review_attributes(ctx, "normal")),
                        Decision::timer(
                            "review-deadline",
                            Duration::from_millis(self.input.policy.review_deadline_ms),
                        ),
                    ]
                }
            }

            (Stage::Enriching, "embed") => {
                let embed: EmbedOutput = match self.parse(activity_id, result) {
                    Ok(v) => v,
                    Err(decisions) => return decisions,
                };
                self.vectors = embed.vectors;
                self.embed_done = true;
                self.maybe_enter_publishing()
            }

            (Stage::Enriching, "graph-extract") => {
                let extracted: ExtractEntitiesOutput = match self.parse(activity_id, result) {
                    Ok(v) => v,
                    Err(decisions) => return decisions,
                };
                self.entities = extracted.entities;
                self.relations = extracted.relations;
                self.graph_extract_done = true;
                self.maybe_enter_publishing()
            }

            (Stage::Publishing, "vector-upsert") => {
                self.vector_ok = Some(true);
                self.resolve_publishing()
            }

            (Stage::Publishing, "graph-upsert") => {
                self.graph_ok = Some(true);
                self.resolve_publishing()
            }

            (Stage::Compensating, "vector-delete") | (Stage::Compensating, "graph-delete") => {
                self.fail(
                    WorkflowError::new("storage publish failed; partial write rolled back")
                        .with_code("partial_publish_rolled_back"),
                )
            }

            (Stage::Archiving, "archive") => self.enter_metadata("ARCHIVED"),

            (Stage::RecordingOutcome, "metadata") => self.enter_notifying(),

            (Stage::Notifying, "notify") => self.complete(),

            _ => vec![],
        }
    }

    fn on_activity_failed(
        &mut self,
        _ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<Decision> {
        match (self.stage, activity_id) {
            (Stage::Publishing, "vector-upsert") => {
                self.vector_ok = Some(false);
                self.resolve_publishing()
            }
            (Stage::Publishing, "graph-upsert") => {
                self.graph_ok = Some(false);
                self.resolve_publishing()
            }
            (Stage::Compensating, _) => self.fail(
                WorkflowError::new(format!(
                    "compensating delete failed after partial publish: {}",
                    error.message
                ))
                .with_code("compensation_failed"),
            ),
            _ => self.fail(
                WorkflowError::new(format!("activity {activity_id} failed: {}", error.message))
                    .with_code(error.error_type.clone().unwrap_or_default()),
            ),
        }
    }

    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<Decision> {
        if self.stage != Stage::AwaitingReview {
            return vec![];
        }

        match timer_id {
            "review-deadline" if !self.escalated => {
                // First deadline miss: escalate once and re-arm.
                self.escalated = true;
                let mut attrs = AttributeMap::new();
                attrs.insert(keys::PRIORITY.into(), AttributeValue::text("high"));
                attrs.insert(
                    keys::DUE_AT.into(),
                    AttributeValue::time(
                        ctx.now()
                            + chrono::Duration::milliseconds(
                                self.input.policy.review_deadline_ms as i64,
                            ),
                    ),
                );
                vec![
                    Decision::upsert_attributes(attrs),
                    Decision::timer(
                        "review-escalation",
                        Duration::from_millis(self.input.policy.review_deadline_ms),
                    ),
                ]
            }
            "review-escalation" => self.enter_archiving("review_timeout"),
            _ => vec![],
        }
    }

    fn on_signal(&mut self, _ctx: &WorkflowContext, signal: &Signal) -> Vec<Decision> {
        if self.stage != Stage::AwaitingReview || signal.name != signal_names::CONTROLLER_DECISION {
            return vec![];
        }

        let decision: ReviewDecision = match signal.decode() {
            Ok(decision) => decision,
            Err(e) => {
                return self.fail(WorkflowError::new(format!(
                    "malformed controller decision: {e}"
                )))
            }
        };

        match decision.decision {
            ReviewVerdict::Approve => {
                self.decided_by = Some(decision.reviewer_principal);
                let mut attrs = AttributeMap::new();
                attrs.insert(keys::STATUS.into(), AttributeValue::text("approved"));
                let mut decisions = vec![Decision::upsert_attributes(attrs)];
                decisions.extend(self.enter_enrichment());
                decisions
            }
            ReviewVerdict::Reject | ReviewVerdict::ChangesRequested => {
                self.decided_by = Some(decision.reviewer_principal);
                let mut attrs = AttributeMap::new();
                attrs.insert(keys::STATUS.into(), AttributeValue::text("rejected"));
                let reason = match decision.decision {
                    ReviewVerdict::ChangesRequested => "changes_requested",
                    _ => "rejected_by_controller",
                };
                let mut decisions = vec![Decision::upsert_attributes(attrs)];
                decisions.extend(self.enter_archiving(reason));
                decisions
            }
            ReviewVerdict::Rollback => {
                // Not meaningful before publish; treated as a reject.
                self.enter_archiving("rejected_by_controller")
            }
        }
    }

    fn query(&self, query_name: &str) -> Option<serde_json::Value> {
        match query_name {
            "get_relevance" => Some(json!({"score": self.score})),
            "get_stage" => Some(json!({"stage": format!("{:?}", self.stage)})),
            _ => None,
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn result(&self) -> Option<Self::Output> {
        (self.finished && self.error.is_none()).then(|| DocumentOutcome {
            state: self.outcome_state.to_string(),
            decided_by: self.decided_by.clone(),
            reason: self.reason.clone(),
        })
    }

    fn error(&self) -> Option<WorkflowError> {
        self.error.clone()
    }
}
