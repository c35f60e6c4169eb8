//! Question-answering workflow
//!
//! vector_search ∥ graph_neighbors → generate_answer → score_confidence →
//! below the confidence bar, create a review task and spawn a QualityReview
//! child workflow, awaiting its verdict (or abandoning it on timeout) →
//! persist the answer → notify the asker.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use tessera_durable::persistence::InboxKind;
use tessera_durable::{
    ActivityError, ActivityOptions, Decision, RetryPolicy, Workflow, WorkflowContext,
    WorkflowError,
};

use crate::activities::answer::{
    GenerateAnswerOutput, GraphNeighborsOutput, ScoreConfidenceOutput, VectorSearchOutput,
};
use crate::workflow_types;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionInput {
    pub question_id: String,
    pub question_text: String,
    pub tenant_id: String,
    /// Principal who asked; receives the completion signal.
    pub asker: String,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// How long to wait on a quality review before abandoning it.
    #[serde(default = "default_review_timeout_ms")]
    pub review_timeout_ms: u64,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_review_timeout_ms() -> u64 {
    24 * 60 * 60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOutcome {
    pub answer: String,
    pub confidence: f64,
    pub review_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Retrieving,
    Generating,
    Scoring,
    CreatingReview,
    AwaitingReview,
    Persisting,
    Notifying,
    Done,
}

pub struct QuestionAnsweringWorkflow {
    input: QuestionInput,
    stage: Stage,

    context_chunks: Vec<String>,
    vector_done: bool,
    graph_done: bool,

    answer: String,
    confidence: f64,
    review_status: String,

    error: Option<WorkflowError>,
    finished: bool,
}

fn ai_options() -> ActivityOptions {
    ActivityOptions::default().with_retry(
        RetryPolicy::exponential()
            .with_max_attempts(4)
            .with_initial_interval(Duration::from_millis(500)),
    )
}

impl QuestionAnsweringWorkflow {
    fn child_review_id(&self) -> String {
        format!("review-{}", self.input.question_id)
    }

    fn fail(&mut self, error: WorkflowError) -> Vec<Decision> {
        self.finished = true;
        self.error = Some(error.clone());
        vec![Decision::fail(error)]
    }

    fn maybe_generate(&mut self) -> Vec<Decision> {
        if !(self.vector_done && self.graph_done) {
            return vec![];
        }

        self.stage = Stage::Generating;
        vec![Decision::schedule_activity_with(
            "generate",
            "generate_answer",
            json!({
                "question_id": self.input.question_id,
                "question_text": self.input.question_text,
                "context": self.context_chunks,
            }),
            ai_options(),
        )]
    }

    fn enter_persisting(&mut self, review_status: &str) -> Vec<Decision> {
        self.stage = Stage::Persisting;
        self.review_status = review_status.to_string();
        vec![Decision::schedule_activity(
            "persist",
            "persist_answer",
            json!({
                "tenant_id": self.input.tenant_id,
                "question_id": self.input.question_id,
                "answer": self.answer,
                "confidence": self.confidence,
                "review_status": self.review_status,
            }),
        )]
    }

    fn complete(&mut self) -> Vec<Decision> {
        self.stage = Stage::Done;
        self.finished = true;
        vec![Decision::complete(json!({
            "answer": self.answer,
            "confidence": self.confidence,
            "review_status": self.review_status,
        }))]
    }
}

impl Workflow for QuestionAnsweringWorkflow {
    const TYPE: &'static str = "question_answering";
    type Input = QuestionInput;
    type Output = QuestionOutcome;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            stage: Stage::Retrieving,
            context_chunks: vec![],
            vector_done: false,
            graph_done: false,
            answer: String::new(),
            confidence: 0.0,
            review_status: "not_required".to_string(),
            error: None,
            finished: false,
        }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<Decision> {
        vec![
            Decision::schedule_activity(
                "vector-search",
                "vector_search",
                json!({
                    "tenant_id": self.input.tenant_id,
                    "question_text": self.input.question_text,
                }),
            ),
            Decision::schedule_activity(
                "graph-neighbors",
                "graph_neighbors",
                json!({
                    "tenant_id": self.input.tenant_id,
                    "seed": self.input.question_text,
                }),
            ),
        ]
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<Decision> {
        match (self.stage, activity_id) {
            (Stage::Retrieving, "vector-search") => {
                if let Ok(search) = serde_json::from_value::<VectorSearchOutput>(result) {
                    self.context_chunks
                        .extend(search.hits.into_iter().map(|hit| hit.text));
                }
                self.vector_done = true;
                self.maybe_generate()
            }

            (Stage::Retrieving, "graph-neighbors") => {
                if let Ok(neighbors) = serde_json::from_value::<GraphNeighborsOutput>(result) {
                    self.context_chunks.extend(
                        neighbors
                            .neighbors
                            .into_iter()
                            .map(|entity| format!("{} ({})", entity.id, entity.label)),
                    );
                }
                self.graph_done = true;
                self.maybe_generate()
            }

            (Stage::Generating, "generate") => {
                let generated: GenerateAnswerOutput = match serde_json::from_value(result) {
                    Ok(v) => v,
                    Err(e) => {
                        return self.fail(WorkflowError::new(format!("bad answer payload: {e}")))
                    }
                };
                self.answer = generated.answer;
                self.stage = Stage::Scoring;
                vec![Decision::schedule_activity_with(
                    "score",
                    "score_confidence",
                    json!({
                        "question_id": self.input.question_id,
                        "question_text": self.input.question_text,
                        "answer": self.answer,
                    }),
                    ai_options(),
                )]
            }

            (Stage::Scoring, "score") => {
                let scored: ScoreConfidenceOutput = match serde_json::from_value(result) {
                    Ok(v) => v,
                    Err(e) => {
                        return self.fail(WorkflowError::new(format!("bad confidence payload: {e}")))
                    }
                };
                self.confidence = scored.confidence;

                if self.confidence >= self.input.confidence_threshold {
                    self.enter_persisting("not_required")
                } else {
                    self.stage = Stage::CreatingReview;
                    vec![Decision::schedule_activity(
                        "create-review",
                        "create_review_task",
                        json!({
                            "tenant_id": self.input.tenant_id,
                            "review_id": self.child_review_id(),
                            "reviewable_type": "answer",
                            "reviewable_id": self.input.question_id,
                        }),
                    )]
                }
            }

            (Stage::CreatingReview, "create-review") => {
                self.stage = Stage::AwaitingReview;
                vec![
                    Decision::StartChildWorkflow {
                        child_workflow_id: self.child_review_id(),
                        workflow_type: workflow_types::QUALITY_REVIEW.to_string(),
                        input: json!({
                            "review_id": self.child_review_id(),
                            "reviewable_type": "answer",
                            "reviewable_id": self.input.question_id,
                            "tenant_id": self.input.tenant_id,
                        }),
                    },
                    Decision::timer(
                        "review-timeout",
                        Duration::from_millis(self.input.review_timeout_ms),
                    ),
                ]
            }

            (Stage::Persisting, "persist") => {
                self.stage = Stage::Notifying;
                vec![Decision::schedule_activity(
                    "notify",
                    "notify_stakeholders",
                    json!({
                        "principal": self.input.asker,
                        "workflow_id": self.input.question_id,
                        "kind": InboxKind::Completion,
                        "payload": {
                            "question_id": self.input.question_id,
                            "answer": self.answer,
                            "confidence": self.confidence,
                            "review_status": self.review_status,
                        },
                    }),
                )]
            }

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
        self.fail(
            WorkflowError::new(format!("activity {activity_id} failed: {}", error.message))
                .with_code(error.error_type.clone().unwrap_or_default()),
        )
    }

    fn on_timer_fired(&mut self, _ctx: &WorkflowContext, timer_id: &str) -> Vec<Decision> {
        if self.stage == Stage::AwaitingReview && timer_id == "review-timeout" {
            // Review abandoned; the answer ships with that caveat recorded.
            return self.enter_persisting("abandoned");
        }
        vec![]
    }

    fn on_child_completed(
        &mut self,
        _ctx: &WorkflowContext,
        child_workflow_id: &str,
        result: serde_json::Value,
    ) -> Vec<Decision> {
        if self.stage != Stage::AwaitingReview || child_workflow_id != self.child_review_id() {
            return vec![];
        }

        let status = result["decision"].as_str().unwrap_or("reviewed").to_string();
        self.enter_persisting(&status)
    }

    fn on_child_failed(
        &mut self,
        _ctx: &WorkflowContext,
        child_workflow_id: &str,
        _error: &WorkflowError,
    ) -> Vec<Decision> {
        if self.stage != Stage::AwaitingReview || child_workflow_id != self.child_review_id() {
            return vec![];
        }

        self.enter_persisting("review_failed")
    }

    fn query(&self, query_name: &str) -> Option<serde_json::Value> {
        match query_name {
            "get_confidence" => Some(json!({"confidence": self.confidence})),
            _ => None,
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn result(&self) -> Option<Self::Output> {
        (self.finished && self.error.is_none()).then(|| QuestionOutcome {
            answer: self.answer.clone(),
            confidence: self.confidence,
            review_status: self.review_status.clone(),
        })
    }

    fn error(&self) -> Option<WorkflowError> {
        self.error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn ctx() -> WorkflowContext {
        WorkflowContext::new("q1", Uuid::now_v7(), "tenant-a", Utc::now(), 1)
    }

    fn input(threshold: f64) -> QuestionInput {
        QuestionInput {
            question_id: "q1".to_string(),
            question_text: "what is tessera?".to_string(),
            tenant_id: "tenant-a".to_string(),
            asker: "u-asker".to_string(),
            confidence_threshold: threshold,
            review_timeout_ms: 1000,
        }
    }

    fn drive_to_scoring(workflow: &mut QuestionAnsweringWorkflow) {
        workflow.on_start(&ctx());
        workflow.on_activity_completed(
            &ctx(),
            "vector-search",
            json!({"hits": [{"id": "d1:0", "score": 0.9, "text": "context"}]}),
        );
        workflow.on_activity_completed(&ctx(), "graph-neighbors", json!({"neighbors": []}));
        workflow.on_activity_completed(
            &ctx(),
            "generate",
            json!({"answer": "an answer", "input_tokens": 10, "output_tokens": 5}),
        );
    }

    #[test]
    fn test_retrieval_is_parallel() {
        let mut workflow = QuestionAnsweringWorkflow::new(input(0.7));
        let decisions = workflow.on_start(&ctx());

        assert_eq!(decisions.len(), 2);
    }

    #[test]
    fn test_generation_waits_for_both_retrievals() {
        let mut workflow = QuestionAnsweringWorkflow::new(input(0.7));
        workflow.on_start(&ctx());

        let decisions = workflow.on_activity_completed(
            &ctx(),
            "vector-search",
            json!({"hits": []}),
        );
        assert!(decisions.is_empty());

        let decisions =
            workflow.on_activity_completed(&ctx(), "graph-neighbors", json!({"neighbors": []}));
        assert!(matches!(
            &decisions[0],
            Decision::ScheduleActivity { activity_type, .. } if activity_type == "generate_answer"
        ));
    }

    #[test]
    fn test_high_confidence_skips_review() {
        let mut workflow = QuestionAnsweringWorkflow::new(input(0.7));
        drive_to_scoring(&mut workflow);

        let decisions =
            workflow.on_activity_completed(&ctx(), "score", json!({"confidence": 0.95}));

        assert!(matches!(
            &decisions[0],
            Decision::ScheduleActivity { activity_type, .. } if activity_type == "persist_answer"
        ));
    }

    #[test]
    fn test_low_confidence_spawns_child_review() {
        let mut workflow = QuestionAnsweringWorkflow::new(input(0.7));
        drive_to_scoring(&mut workflow);

        let decisions = workflow.on_activity_completed(&ctx(), "score", json!({"confidence": 0.3}));
        assert!(matches!(
            &decisions[0],
            Decision::ScheduleActivity { activity_type, .. }
                if activity_type == "create_review_task"
        ));

        let decisions =
            workflow.on_activity_completed(&ctx(), "create-review", json!({"review_id": "review-q1"}));
        assert!(matches!(
            &decisions[0],
            Decision::StartChildWorkflow { workflow_type, .. }
                if workflow_type == workflow_types::QUALITY_REVIEW
        ));
        assert!(matches!(decisions[1], Decision::StartTimer { .. }));
    }

    #[test]
    fn test_child_result_feeds_persist() {
        let mut workflow = QuestionAnsweringWorkflow::new(input(0.7));
        drive_to_scoring(&mut workflow);
        workflow.on_activity_completed(&ctx(), "score", json!({"confidence": 0.3}));
        workflow.on_activity_completed(&ctx(), "create-review", json!({"review_id": "review-q1"}));

        let decisions = workflow.on_child_completed(
            &ctx(),
            "review-q1",
            json!({"review_id": "review-q1", "decision": "approve"}),
        );

        assert!(matches!(
            &decisions[0],
            Decision::ScheduleActivity { activity_type, .. } if activity_type == "persist_answer"
        ));
        assert_eq!(workflow.review_status, "approve");
    }

    #[test]
    fn test_review_timeout_abandons() {
        let mut workflow = QuestionAnsweringWorkflow::new(input(0.7));
        drive_to_scoring(&mut workflow);
        workflow.on_activity_completed(&ctx(), "score", json!({"confidence": 0.3}));
        workflow.on_activity_completed(&ctx(), "create-review", json!({"review_id": "review-q1"}));

        let decisions = workflow.on_timer_fired(&ctx(), "review-timeout");

        assert!(matches!(
            &decisions[0],
            Decision::ScheduleActivity { activity_type, .. } if activity_type == "persist_answer"
        ));
        assert_eq!(workflow.review_status, "abandoned");

        // A child verdict arriving after abandonment changes nothing.
        let late = workflow.on_child_completed(&ctx(), "review-q1", json!({"decision": "approve"}));
        assert!(late.is_empty());
    }

    #[test]
    fn test_completes_after_notify() {
        let mut workflow = QuestionAnsweringWorkflow::new(input(0.7));
        drive_to_scoring(&mut workflow);
        workflow.on_activity_completed(&ctx(), "score", json!({"confidence": 0.9}));
        workflow.on_activity_completed(&ctx(), "persist", json!({"persisted": true}));
        let decisions = workflow.on_activity_completed(&ctx(), "notify", json!({"delivered": true}));

        let Decision::CompleteWorkflow { result } = &decisions[0] else {
            panic!("expected completion");
        };
        assert_eq!(result["answer"], "an answer");
        assert_eq!(result["review_status"], "not_required");
    }
}
