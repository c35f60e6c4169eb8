// Question-answering routes

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tessera_durable::{IdReusePolicy, StartOptions};
use tessera_workflows::answer::QuestionInput;
use tessera_workflows::workflow_types;
use utoipa::ToSchema;

use crate::auth::Principal;
use crate::documents::WorkflowAccepted;
use crate::error::ApiError;
use crate::state::AppState;

/// Request to answer a question
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateQuestionRequest {
    /// Caller-assigned question id; doubles as the workflow id.
    pub question_id: String,
    pub question: String,
    pub domain_id: String,
    /// Principal the answer belongs to; defaults to the caller.
    #[serde(default)]
    pub user_id: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/questions", post(create_question))
        .with_state(state)
}

/// POST /api/v1/questions - Start question answering
#[utoipa::path(
    post,
    path = "/api/v1/questions",
    request_body = CreateQuestionRequest,
    responses(
        (status = 202, description = "Workflow accepted", body = WorkflowAccepted),
        (status = 401, description = "Missing or invalid token"),
        (status = 409, description = "Duplicate question id")
    ),
    tag = "questions"
)]
pub async fn create_question(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<CreateQuestionRequest>,
) -> Result<(StatusCode, Json<WorkflowAccepted>), ApiError> {
    if req.question.trim().is_empty() {
        return Err(ApiError::Validation("question must not be empty".into()));
    }

    let input = QuestionInput {
        question_id: req.question_id.clone(),
        question_text: req.question,
        tenant_id: req.domain_id.clone(),
        asker: req.user_id.unwrap_or(principal.subject),
        confidence_threshold: 0.7,
        review_timeout_ms: 24 * 60 * 60 * 1000,
    };

    state
        .executor
        .start_workflow_by_type(
            req.question_id.clone(),
            workflow_types::QUESTION_ANSWERING,
            serde_json::to_value(&input)
                .map_err(|e| ApiError::Validation(e.to_string()))?,
            StartOptions::new(req.domain_id).with_id_reuse_policy(IdReusePolicy::RejectDuplicate),
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WorkflowAccepted {
            workflow_id: req.question_id,
            status: "processing".to_string(),
        }),
    ))
}
