// Quality-review routes

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tessera_durable::{IdReusePolicy, StartOptions};
use tessera_workflows::review::ReviewInput;
use tessera_workflows::workflow_types;
use utoipa::ToSchema;

use crate::auth::Principal;
use crate::documents::WorkflowAccepted;
use crate::error::ApiError;
use crate::state::AppState;

/// Request to open a quality review directly (admin path)
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateReviewRequest {
    /// Caller-assigned review id; doubles as the workflow id.
    pub review_id: String,
    /// "document" or "answer".
    pub reviewable_type: String,
    pub reviewable_id: String,
    pub domain_id: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/reviews", post(create_review))
        .with_state(state)
}

/// POST /api/v1/reviews - Start a quality review
#[utoipa::path(
    post,
    path = "/api/v1/reviews",
    request_body = CreateReviewRequest,
    responses(
        (status = 202, description = "Workflow accepted", body = WorkflowAccepted),
        (status = 400, description = "Invalid reviewable type"),
        (status = 409, description = "Duplicate review id")
    ),
    tag = "reviews"
)]
pub async fn create_review(
    State(state): State<AppState>,
    _principal: Principal,
    Json(req): Json<CreateReviewRequest>,
) -> Result<(StatusCode, Json<WorkflowAccepted>), ApiError> {
    if !matches!(req.reviewable_type.as_str(), "document" | "answer") {
        return Err(ApiError::Validation(format!(
            "unknown reviewable_type: {}",
            req.reviewable_type
        )));
    }

    let input = ReviewInput {
        review_id: req.review_id.clone(),
        reviewable_type: req.reviewable_type,
        reviewable_id: req.reviewable_id,
        tenant_id: req.domain_id.clone(),
    };

    state
        .executor
        .start_workflow_by_type(
            req.review_id.clone(),
            workflow_types::QUALITY_REVIEW,
            serde_json::to_value(&input)
                .map_err(|e| ApiError::Validation(e.to_string()))?,
            StartOptions::new(req.domain_id).with_id_reuse_policy(IdReusePolicy::RejectDuplicate),
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WorkflowAccepted {
            workflow_id: req.review_id,
            status: "processing".to_string(),
        }),
    ))
}
