//! End-to-end scenarios over the in-memory store
//!
//! Each test drives the engine deterministically: activities are claimed and
//! executed inline against fake adapters with scripted outputs, and the
//! engine runtime is ticked between rounds so completions, timers and
//! timeouts flow exactly as they would under the background loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use tessera_durable::engine::EngineRuntime;
use tessera_durable::persistence::{ExecutionStore, IdReusePolicy, InMemoryExecutionStore};
use tessera_durable::workflow::attributes::{keys, AttributeFilter};
use tessera_durable::workflow::{EventKind, ReviewDecision, ReviewVerdict};
use tessera_durable::{
    ActivityContext, ActivitySet, ExecutorError, SignalFanout, StartOptions, StoreError, TaskQueue,
    WorkflowExecutor, WorkflowStatus,
};

use tessera_workflows::adapters::{
    Adapters, BlobStore, FakeLlm, FanoutNotifier, MemoryBlobStore, MemoryGraphStore,
    MemoryMetadataStore, MemoryVectorIndex, MetadataStore,
};
use tessera_workflows::document::{DocumentInput, DocumentPolicy};
use tessera_workflows::{answer::QuestionInput, register_workflows, signal_names, workflow_types};

struct Harness {
    store: Arc<InMemoryExecutionStore>,
    executor: Arc<WorkflowExecutor>,
    runtime: EngineRuntime,
    activities: Arc<ActivitySet>,
    llm: Arc<FakeLlm>,
    vectors: Arc<MemoryVectorIndex>,
    graph: Arc<MemoryGraphStore>,
    metadata: Arc<MemoryMetadataStore>,
    blobs: Arc<MemoryBlobStore>,
    fanout: Arc<SignalFanout>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryExecutionStore::new());
        let fanout = Arc::new(SignalFanout::new(
            store.clone() as Arc<dyn ExecutionStore>
        ));

        let llm = Arc::new(FakeLlm::new());
        let vectors = Arc::new(MemoryVectorIndex::new());
        let graph = Arc::new(MemoryGraphStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());

        let adapters = Adapters {
            blobs: blobs.clone(),
            vectors: vectors.clone(),
            graph: graph.clone(),
            llm: llm.clone(),
            metadata: metadata.clone(),
            notifier: Arc::new(FanoutNotifier::new(fanout.clone())),
        };

        let mut executor = WorkflowExecutor::new(store.clone() as Arc<dyn ExecutionStore>);
        register_workflows(&mut executor);
        let executor = Arc::new(executor);

        Self {
            runtime: EngineRuntime::new(Arc::clone(&executor)),
            activities: Arc::new(tessera_workflows::activity_set(&adapters)),
            store,
            executor,
            llm,
            vectors,
            graph,
            metadata,
            blobs,
            fanout,
        }
    }

    /// Execute one round: run every claimable task, then tick the engine.
    /// Returns the number of tasks executed.
    async fn round(&self) -> usize {
        let mut executed = 0;

        for queue in TaskQueue::ALL {
            let tasks = self
                .store
                .claim_tasks(queue, "itest-worker", &[], 100)
                .await
                .unwrap();

            for task in tasks {
                executed += 1;
                let handler = self
                    .activities
                    .get(&task.activity_type)
                    .unwrap_or_else(|| panic!("no handler for {}", task.activity_type));

                let ctx = ActivityContext::new(
                    task.workflow_id.clone(),
                    task.run_id,
                    task.activity_id.clone(),
                    task.attempt,
                    task.options.retry_policy.max_attempts,
                    Utc::now() + chrono::Duration::seconds(60),
                );

                match handler(ctx, task.input.clone()).await {
                    Ok(result) => {
                        self.store.complete_task(task.task_id, result).await.unwrap();
                    }
                    Err(error) => {
                        self.store.fail_task(task.task_id, &error).await.unwrap();
                    }
                }
            }
        }

        self.runtime.tick().await.unwrap();
        executed
    }

    /// Drive rounds until the predicate holds, sleeping between rounds so
    /// retry delays and timers elapse. Panics after the deadline.
    async fn drive_until<F>(&self, deadline: Duration, mut done: F)
    where
        F: FnMut() -> futures::future::BoxFuture<'static, bool>,
    {
        let limit = tokio::time::Instant::now() + deadline;
        loop {
            self.round().await;
            if done().await {
                return;
            }
            if tokio::time::Instant::now() >= limit {
                panic!("scenario did not converge within {deadline:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn drive_to_terminal(&self, workflow_id: &str, deadline: Duration) -> WorkflowStatus {
        let store = self.store.clone();
        let id = workflow_id.to_string();
        self.drive_until(deadline, move || {
            let store = store.clone();
            let id = id.clone();
            Box::pin(async move {
                store
                    .get_execution(&id)
                    .await
                    .map(|r| r.status.is_terminal())
                    .unwrap_or(false)
            })
        })
        .await;

        self.store.get_execution(workflow_id).await.unwrap().status
    }

    /// Drive until no claimable work, staged reports or due timers remain.
    async fn drive_to_idle(&self) {
        loop {
            let executed = self.round().await;
            if executed == 0 {
                // One extra tick for completions staged by the last round.
                self.runtime.tick().await.unwrap();
                return;
            }
        }
    }

    async fn start_document(&self, document_id: &str, policy: DocumentPolicy) {
        self.blobs
            .put(
                &format!("docs/{document_id}.txt"),
                b"A document about durable workflow engines in Rust.".to_vec(),
            )
            .await
            .unwrap();

        let input = DocumentInput {
            document_id: document_id.to_string(),
            tenant_id: "tenant-a".to_string(),
            blob_path: format!("docs/{document_id}.txt"),
            contributor: "u-contrib".to_string(),
            policy,
        };

        self.executor
            .start_workflow_by_type(
                document_id.to_string(),
                workflow_types::DOCUMENT_PROCESSING,
                serde_json::to_value(&input).unwrap(),
                StartOptions::new("tenant-a")
                    .with_id_reuse_policy(IdReusePolicy::RejectDuplicate),
            )
            .await
            .unwrap();
    }

    fn script_assessment(&self, score: f64) {
        self.llm
            .script(format!(r#"{{"score": {score}, "rationale": "scripted"}}"#));
    }

    fn script_entities(&self) {
        self.llm.script(
            r#"{"entities": [{"id": "rust", "label": "Topic", "properties": {}}], "relations": []}"#,
        );
    }
}

fn policy(review_deadline_ms: u64) -> DocumentPolicy {
    DocumentPolicy {
        auto_approve_threshold: 8.0,
        relevance_threshold: 5.0,
        review_deadline_ms,
    }
}

async fn history_kinds(harness: &Harness, workflow_id: &str) -> Vec<EventKind> {
    let record = harness.store.get_execution(workflow_id).await.unwrap();
    harness
        .store
        .load_history(record.run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

// =============================================================================
// S1: auto-approve
// =============================================================================

#[tokio::test]
async fn s1_auto_approve_document() {
    let harness = Harness::new();
    harness.script_assessment(9.1);
    harness.script_entities();

    harness.start_document("d1", policy(60_000)).await;
    let status = harness.drive_to_terminal("d1", Duration::from_secs(30)).await;
    assert_eq!(status, WorkflowStatus::Completed);

    let record = harness.store.get_execution("d1").await.unwrap();
    assert_eq!(record.result, Some(json!({"state": "PUBLISHED"})));

    let kinds = history_kinds(&harness, "d1").await;

    // No review parking on the auto-approve path.
    assert!(!kinds
        .iter()
        .any(|k| matches!(k, EventKind::SearchAttributesUpserted { .. })));

    // The assessment completion is followed directly by the parallel
    // enrichment schedules.
    let assess_done = kinds
        .iter()
        .position(|k| matches!(k, EventKind::ActivityCompleted { activity_id, .. } if activity_id == "assess"))
        .expect("assessment completed");
    let scheduled_after: Vec<&str> = kinds[assess_done..]
        .iter()
        .filter_map(|k| match k {
            EventKind::ActivityScheduled { activity_type, .. } => Some(activity_type.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled_after[0], "generate_embeddings");
    assert_eq!(scheduled_after[1], "extract_graph_entities");

    // External effects landed.
    assert!(harness.vectors.point_count("tenant-a") > 0);
    assert_eq!(harness.graph.entity_count("tenant-a"), 1);
    assert_eq!(
        harness.metadata.document_state("tenant-a", "d1").as_deref(),
        Some("PUBLISHED")
    );
}

// =============================================================================
// S2: HITL approval
// =============================================================================

#[tokio::test]
async fn s2_hitl_approval_path() {
    let harness = Harness::new();
    harness.script_assessment(6.5);

    harness.start_document("d1", policy(600_000)).await;
    harness.drive_to_idle().await;

    // Parked: searchable through the review-queue predicate.
    let filter = AttributeFilter::new()
        .eq(keys::STATUS, "pending")
        .eq(keys::QUEUE, "document-review");
    let parked = harness.executor.list_workflows(&filter).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].workflow_id, "d1");

    let attrs = harness
        .store
        .get_search_attributes(parked[0].run_id)
        .await
        .unwrap();
    assert_eq!(attrs.get(keys::ASSIGNEE).unwrap().as_text(), Some("controller"));
    assert_eq!(attrs.get(keys::RELEVANCE_SCORE).unwrap().as_number(), Some(6.5));

    // Still running, waiting on the decision.
    assert_eq!(
        harness.store.get_execution("d1").await.unwrap().status,
        WorkflowStatus::Running
    );

    // Reviewer approves.
    harness.script_entities();
    let decision = ReviewDecision::new(ReviewVerdict::Approve, "u1");
    harness
        .executor
        .signal_workflow(
            "d1",
            None,
            signal_names::CONTROLLER_DECISION,
            serde_json::to_value(&decision).unwrap(),
        )
        .await
        .unwrap();

    let status = harness.drive_to_terminal("d1", Duration::from_secs(30)).await;
    assert_eq!(status, WorkflowStatus::Completed);

    let record = harness.store.get_execution("d1").await.unwrap();
    assert_eq!(
        record.result,
        Some(json!({"state": "PUBLISHED", "decided_by": "u1"}))
    );
}

// =============================================================================
// S3: HITL timeout escalation
// =============================================================================

#[tokio::test]
async fn s3_hitl_timeout_escalates_then_archives() {
    let harness = Harness::new();
    harness.script_assessment(6.5);

    harness.start_document("d1", policy(200)).await;

    let status = harness.drive_to_terminal("d1", Duration::from_secs(30)).await;
    assert_eq!(status, WorkflowStatus::Completed);

    let record = harness.store.get_execution("d1").await.unwrap();
    assert_eq!(
        record.result,
        Some(json!({"state": "ARCHIVED", "reason": "review_timeout"}))
    );

    // The escalation pass re-upserted priority=high before the second wait.
    let kinds = history_kinds(&harness, "d1").await;
    let escalated = kinds.iter().any(|k| match k {
        EventKind::SearchAttributesUpserted { attributes } => attributes
            .get(keys::PRIORITY)
            .and_then(|v| v.as_text().map(|s| s == "high"))
            .unwrap_or(false),
        _ => false,
    });
    assert!(escalated, "expected a priority escalation upsert");

    assert_eq!(
        harness.metadata.document_state("tenant-a", "d1").as_deref(),
        Some("ARCHIVED")
    );
}

// =============================================================================
// S4: transient failures with retry exhaustion and compensation
// =============================================================================

#[tokio::test]
async fn s4_partial_publish_is_compensated() {
    let harness = Harness::new();
    harness.script_assessment(9.1);
    harness.script_entities();

    // Embeddings fail transiently three times, then succeed on the fourth
    // attempt; the graph store never recovers and exhausts its retries.
    harness.llm.fail_next_embeds(3);
    harness.graph.fail_next_merges(10);

    harness.start_document("d1", policy(60_000)).await;
    let status = harness.drive_to_terminal("d1", Duration::from_secs(60)).await;
    assert_eq!(status, WorkflowStatus::Failed);

    let record = harness.store.get_execution("d1").await.unwrap();
    assert_eq!(
        record.error.unwrap().code.as_deref(),
        Some("partial_publish_rolled_back")
    );

    // The compensating delete ran and emptied the vector index again.
    let kinds = history_kinds(&harness, "d1").await;
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::ActivityScheduled { activity_type, .. }
            if activity_type == "delete_from_vector_index"
    )));
    assert_eq!(harness.vectors.point_count("tenant-a"), 0);

    // Retried attempts are visible in history as non-final failures.
    let transient_embed_failures = kinds
        .iter()
        .filter(|k| matches!(
            k,
            EventKind::ActivityFailed { activity_id, will_retry: true, .. }
                if activity_id == "embed"
        ))
        .count();
    assert_eq!(transient_embed_failures, 3);
}

// =============================================================================
// S5: duplicate start with RejectDuplicate
// =============================================================================

#[tokio::test]
async fn s5_duplicate_start_rejected() {
    let harness = Harness::new();
    harness.script_assessment(9.1);

    harness.start_document("d1", policy(60_000)).await;

    let input = DocumentInput {
        document_id: "d1".to_string(),
        tenant_id: "tenant-a".to_string(),
        blob_path: "docs/d1.txt".to_string(),
        contributor: "u-contrib".to_string(),
        policy: policy(60_000),
    };
    let second = harness
        .executor
        .start_workflow_by_type(
            "d1".to_string(),
            workflow_types::DOCUMENT_PROCESSING,
            serde_json::to_value(&input).unwrap(),
            StartOptions::new("tenant-a").with_id_reuse_policy(IdReusePolicy::RejectDuplicate),
        )
        .await;

    assert!(matches!(
        second,
        Err(ExecutorError::Store(StoreError::AlreadyStarted(_)))
    ));

    let kinds = history_kinds(&harness, "d1").await;
    let starts = kinds
        .iter()
        .filter(|k| matches!(k, EventKind::WorkflowStarted { .. }))
        .count();
    assert_eq!(starts, 1);
}

// =============================================================================
// S6: low-confidence answer spawns a child quality review
// =============================================================================

#[tokio::test]
async fn s6_low_confidence_child_review() {
    let harness = Harness::new();

    // generate_answer, then score_confidence.
    harness.llm.script("Tessera is a workflow engine.");
    harness.llm.script(r#"{"confidence": 0.3}"#);

    let input = QuestionInput {
        question_id: "q1".to_string(),
        question_text: "what is tessera?".to_string(),
        tenant_id: "tenant-a".to_string(),
        asker: "u-asker".to_string(),
        confidence_threshold: 0.7,
        review_timeout_ms: 600_000,
    };
    harness
        .executor
        .start_workflow_by_type(
            "q1".to_string(),
            workflow_types::QUESTION_ANSWERING,
            serde_json::to_value(&input).unwrap(),
            StartOptions::new("tenant-a"),
        )
        .await
        .unwrap();

    harness.drive_to_idle().await;

    // Parent blocked on the child; child parked pending a decision.
    assert_eq!(
        harness.store.get_execution("q1").await.unwrap().status,
        WorkflowStatus::Running
    );
    let child = harness.store.get_execution("review-q1").await.unwrap();
    assert_eq!(child.status, WorkflowStatus::Running);
    assert_eq!(child.parent.as_ref().unwrap().workflow_id, "q1");
    assert!(harness.metadata.has_review("tenant-a", "review-q1"));

    // Reviewer approves the child review.
    let decision = ReviewDecision::new(ReviewVerdict::Approve, "u-reviewer");
    harness
        .executor
        .signal_workflow(
            "review-q1",
            None,
            signal_names::REVIEW_DECISION,
            serde_json::to_value(&decision).unwrap(),
        )
        .await
        .unwrap();

    let status = harness.drive_to_terminal("q1", Duration::from_secs(30)).await;
    assert_eq!(status, WorkflowStatus::Completed);
    assert_eq!(
        harness.store.get_execution("review-q1").await.unwrap().status,
        WorkflowStatus::Completed
    );

    // Parent observed the child result in its history and persisted the
    // answer with the review verdict.
    let kinds = history_kinds(&harness, "q1").await;
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::ChildWorkflowStarted { .. })));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::ChildWorkflowCompleted { .. })));

    let answer = harness
        .metadata
        .get_answer("tenant-a", "q1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer["review_status"], "approve");
    assert_eq!(harness.metadata.quality_score("tenant-a", "q1"), Some(1.0));
}

// =============================================================================
// Cross-cutting invariants
// =============================================================================

#[tokio::test]
async fn invariant_every_scheduled_activity_resolves() {
    let harness = Harness::new();
    harness.script_assessment(9.1);
    harness.script_entities();

    harness.start_document("d1", policy(60_000)).await;
    harness.drive_to_terminal("d1", Duration::from_secs(30)).await;

    let kinds = history_kinds(&harness, "d1").await;
    let scheduled: Vec<&str> = kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::ActivityScheduled { activity_id, .. } => Some(activity_id.as_str()),
            _ => None,
        })
        .collect();

    for activity_id in scheduled {
        let resolved = kinds.iter().any(|k| match k {
            EventKind::ActivityCompleted { activity_id: id, .. } => id == activity_id,
            EventKind::ActivityFailed { activity_id: id, will_retry: false, .. } => {
                id == activity_id
            }
            EventKind::ActivityTimedOut { activity_id: id, will_retry: false, .. } => {
                id == activity_id
            }
            _ => false,
        });
        assert!(resolved, "activity {activity_id} has no final outcome");
    }
}

#[tokio::test]
async fn invariant_inbox_sequences_strictly_increase() {
    let harness = Harness::new();
    harness.script_assessment(9.1);
    harness.script_entities();

    harness.start_document("d1", policy(60_000)).await;
    harness.drive_to_terminal("d1", Duration::from_secs(30)).await;

    harness.script_assessment(9.1);
    harness.script_entities();
    harness.start_document("d2", policy(60_000)).await;
    harness.drive_to_terminal("d2", Duration::from_secs(30)).await;

    // The contributor got one completion signal per document, sequenced.
    let inbox = harness.fanout.catch_up("u-contrib", 0).await.unwrap();
    assert_eq!(inbox.len(), 2);
    assert!(inbox[0].sequence < inbox[1].sequence);

    assert_eq!(harness.store.unread_inbox_count("u-contrib").await.unwrap(), 2);
    assert!(harness
        .store
        .mark_inbox_read("u-contrib", inbox[0].sequence)
        .await
        .unwrap());
    assert_eq!(harness.store.unread_inbox_count("u-contrib").await.unwrap(), 1);
}

#[tokio::test]
async fn invariant_replay_appends_nothing_on_stable_history() {
    let harness = Harness::new();
    harness.script_assessment(6.5);

    harness.start_document("d1", policy(600_000)).await;
    harness.drive_to_idle().await;

    let record = harness.store.get_execution("d1").await.unwrap();
    let before = harness.store.load_history(record.run_id).await.unwrap().len();

    // Reprocessing a parked run is a no-op: same decisions, all anchored.
    harness.executor.process_run(record.run_id).await.unwrap();
    harness.executor.process_run(record.run_id).await.unwrap();

    let after = harness.store.load_history(record.run_id).await.unwrap().len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn invariant_signal_fifo_order() {
    let harness = Harness::new();
    harness.script_assessment(6.5);

    harness.start_document("d1", policy(600_000)).await;
    harness.drive_to_idle().await;

    let record = harness.store.get_execution("d1").await.unwrap();

    // Two decisions race in; the first one wins, the second is a no-op for
    // the state machine but both are consumed in delivery order.
    let approve = ReviewDecision::new(ReviewVerdict::Approve, "u1");
    let reject = ReviewDecision::new(ReviewVerdict::Reject, "u2");
    harness
        .store
        .push_signal(
            record.run_id,
            tessera_durable::Signal::new(
                signal_names::CONTROLLER_DECISION,
                serde_json::to_value(&approve).unwrap(),
            ),
        )
        .await
        .unwrap();
    harness
        .store
        .push_signal(
            record.run_id,
            tessera_durable::Signal::new(
                signal_names::CONTROLLER_DECISION,
                serde_json::to_value(&reject).unwrap(),
            ),
        )
        .await
        .unwrap();

    harness.script_entities();
    harness.executor.process_run(record.run_id).await.unwrap();

    let kinds = history_kinds(&harness, "d1").await;
    let received: Vec<String> = kinds
        .iter()
        .filter_map(|k| match k {
            EventKind::SignalReceived { signal } => {
                signal.payload["reviewer_principal"].as_str().map(String::from)
            }
            _ => None,
        })
        .collect();
    assert_eq!(received, vec!["u1".to_string(), "u2".to_string()]);

    let status = harness.drive_to_terminal("d1", Duration::from_secs(30)).await;
    assert_eq!(status, WorkflowStatus::Completed);

    // The first signal decided the outcome.
    let record = harness.store.get_execution("d1").await.unwrap();
    assert_eq!(record.result.unwrap()["decided_by"], "u1");
}
