//! Quality-review workflow
//!
//! Spawned as a child of document processing or question answering, or
//! started directly by an admin. Parks with pending search attributes until
//! a `review_decision` signal arrives, applies the verdict (publish, archive
//! or revert the vector+graph writes), then records the quality score.

use serde::{Deserialize, Serialize};
use serde_json::json;

use tessera_durable::workflow::attributes::{keys, AttributeMap, AttributeValue};
use tessera_durable::workflow::{ReviewDecision, ReviewVerdict};
use tessera_durable::{
    ActivityError, Decision, Signal, Workflow, WorkflowContext, WorkflowError,
};

use crate::signal_names;

const REVIEW_QUEUE: &str = "quality-review";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewInput {
    pub review_id: String,
    /// What is being reviewed: "document" or "answer".
    pub reviewable_type: String,
    pub reviewable_id: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub review_id: String,
    pub decision: String,
    pub decided_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingDecision,
    Applying,
    Reverting,
    Scoring,
    Done,
}

pub struct QualityReviewWorkflow {
    input: ReviewInput,
    stage: Stage,

    decision: Option<ReviewVerdict>,
    decided_by: String,

    /// Revert progress when rolling back both stores.
    vector_reverted: bool,
    graph_reverted: bool,

    error: Option<WorkflowError>,
    finished: bool,
}

impl QualityReviewWorkflow {
    fn reviewable(&self) -> serde_json::Value {
        json!({
            "tenant_id": self.input.tenant_id,
            "reviewable_type": self.input.reviewable_type,
            "reviewable_id": self.input.reviewable_id,
        })
    }

    fn fail(&mut self, error: WorkflowError) -> Vec<Decision> {
        self.finished = true;
        self.error = Some(error.clone());
        vec![Decision::fail(error)]
    }

    fn decision_name(&self) -> &'static str {
        match self.decision {
            Some(ReviewVerdict::Approve) => "approve",
            Some(ReviewVerdict::Rollback) => "rollback",
            _ => "reject",
        }
    }

    fn quality_score(&self) -> f64 {
        match self.decision {
            Some(ReviewVerdict::Approve) => 1.0,
            _ => 0.0,
        }
    }

    fn enter_scoring(&mut self) -> Vec<Decision> {
        self.stage = Stage::Scoring;
        vec![Decision::schedule_activity(
            "quality-score",
            "update_quality_scores",
            json!({
                "tenant_id": self.input.tenant_id,
                "reviewable_id": self.input.reviewable_id,
                "score": self.quality_score(),
            }),
        )]
    }

    fn complete(&mut self) -> Vec<Decision> {
        self.stage = Stage::Done;
        self.finished = true;
        vec![Decision::complete(json!({
            "review_id": self.input.review_id,
            "decision": self.decision_name(),
            "decided_by": self.decided_by,
        }))]
    }
}

impl Workflow for QualityReviewWorkflow {
    const TYPE: &'static str = "quality_review";
    type Input = ReviewInput;
    type Output = ReviewOutcome;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            stage: Stage::AwaitingDecision,
            decision: None,
            decided_by: String::new(),
            vector_reverted: false,
            graph_reverted: false,
            error: None,
            finished: false,
        }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<Decision> {
        let mut attrs = AttributeMap::new();
        attrs.insert(keys::ASSIGNEE.into(), AttributeValue::text("controller"));
        attrs.insert(keys::QUEUE.into(), AttributeValue::text(REVIEW_QUEUE));
        attrs.insert(keys::STATUS.into(), AttributeValue::text("pending"));
        attrs.insert(keys::PRIORITY.into(), AttributeValue::text("normal"));
        attrs.insert(
            keys::TENANT.into(),
            AttributeValue::text(&*self.input.tenant_id),
        );
        attrs.insert(
            keys::DOCUMENT_ID.into(),
            AttributeValue::text(&*self.input.reviewable_id),
        );

        vec![Decision::upsert_attributes(attrs)]
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        activity_id: &str,
        _result: serde_json::Value,
    ) -> Vec<Decision> {
        match (self.stage, activity_id) {
            (Stage::Applying, "apply") => self.enter_scoring(),

            (Stage::Reverting, "vector-revert") => {
                self.vector_reverted = true;
                if self.graph_reverted {
                    self.enter_scoring()
                } else {
                    vec![]
                }
            }

            (Stage::Reverting, "graph-revert") => {
                self.graph_reverted = true;
                if self.vector_reverted {
                    self.enter_scoring()
                } else {
                    vec![]
                }
            }

            (Stage::Scoring, "quality-score") => self.complete(),

            _ => vec![],
        }
    }

    fn on_activity_failed(
        &mut self,
        _ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<Decision> {
        self.fail(
            WorkflowError::new(format!("activity {activity_id} failed: {}", error.message))
                .with_code(error.error_type.clone().unwrap_or_default()),
        )
    }

    fn on_signal(&mut self, _ctx: &WorkflowContext, signal: &Signal) -> Vec<Decision> {
        if self.stage != Stage::AwaitingDecision || signal.name != signal_names::REVIEW_DECISION {
            return vec![];
        }

        let decision: ReviewDecision = match signal.decode() {
            Ok(decision) => decision,
            Err(e) => {
                return self.fail(WorkflowError::new(format!("malformed review decision: {e}")))
            }
        };

        self.decided_by = decision.reviewer_principal.clone();
        self.decision = Some(match decision.decision {
            // The quality channel folds change requests into rejects.
            ReviewVerdict::ChangesRequested => ReviewVerdict::Reject,
            other => other,
        });

        let mut attrs = AttributeMap::new();
        attrs.insert(keys::STATUS.into(), AttributeValue::text("decided"));
        let mut decisions = vec![Decision::upsert_attributes(attrs)];

        match self.decision {
            Some(ReviewVerdict::Approve) => {
                self.stage = Stage::Applying;
                decisions.push(Decision::schedule_activity(
                    "apply",
                    "publish_reviewable",
                    self.reviewable(),
                ));
            }
            Some(ReviewVerdict::Reject) => {
                self.stage = Stage::Applying;
                decisions.push(Decision::schedule_activity(
                    "apply",
                    "archive_reviewable",
                    self.reviewable(),
                ));
            }
            Some(ReviewVerdict::Rollback) => {
                self.stage = Stage::Reverting;
                decisions.push(Decision::schedule_activity(
                    "vector-revert",
                    "delete_from_vector_index",
                    json!({
                        "tenant_id": self.input.tenant_id,
                        "document_id": self.input.reviewable_id,
                    }),
                ));
                decisions.push(Decision::schedule_activity(
                    "graph-revert",
                    "delete_from_graph",
                    json!({
                        "tenant_id": self.input.tenant_id,
                        "document_id": self.input.reviewable_id,
                    }),
                ));
            }
            _ => {}
        }

        decisions
    }

    fn query(&self, query_name: &str) -> Option<serde_json::Value> {
        match query_name {
            "get_decision" => Some(json!({
                "decision": self.decision.map(|_| self.decision_name()),
            })),
            _ => None,
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn result(&self) -> Option<Self::Output> {
        (self.finished && self.error.is_none()).then(|| ReviewOutcome {
            review_id: self.input.review_id.clone(),
            decision: self.decision_name().to_string(),
            decided_by: self.decided_by.clone(),
        })
    }

    fn error(&self) -> Option<WorkflowError> {
        self.error.clone()
    }
}
