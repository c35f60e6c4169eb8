// Document ingestion routes

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tessera_durable::{IdReusePolicy, StartOptions};
use tessera_workflows::document::{DocumentInput, DocumentPolicy};
use tessera_workflows::workflow_types;
use utoipa::ToSchema;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

/// Request to ingest a document
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateDocumentRequest {
    /// Caller-assigned document id; doubles as the workflow id.
    pub document_id: String,
    /// Tenant the document belongs to.
    pub domain_id: String,
    /// Blob-store path of the uploaded file.
    pub file_path: String,
}

/// Accepted-for-processing response
#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowAccepted {
    pub workflow_id: String,
    pub status: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/documents", post(create_document))
        .with_state(state)
}

/// POST /api/v1/documents - Start document processing
#[utoipa::path(
    post,
    path = "/api/v1/documents",
    request_body = CreateDocumentRequest,
    responses(
        (status = 202, description = "Workflow accepted", body = WorkflowAccepted),
        (status = 401, description = "Missing or invalid token"),
        (status = 409, description = "Duplicate document id"),
        (status = 503, description = "Orchestrator unreachable")
    ),
    tag = "documents"
)]
pub async fn create_document(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<WorkflowAccepted>), ApiError> {
    if req.document_id.is_empty() {
        return Err(ApiError::Validation("document_id must not be empty".into()));
    }

    let input = DocumentInput {
        document_id: req.document_id.clone(),
        tenant_id: req.domain_id.clone(),
        blob_path: req.file_path,
        contributor: principal.subject,
        policy: DocumentPolicy::default(),
    };

    state
        .executor
        .start_workflow_by_type(
            req.document_id.clone(),
            workflow_types::DOCUMENT_PROCESSING,
            serde_json::to_value(&input)
                .map_err(|e| ApiError::Validation(e.to_string()))?,
            StartOptions::new(req.domain_id).with_id_reuse_policy(IdReusePolicy::RejectDuplicate),
        )
        .await?;

    tracing::info!(workflow_id = %req.document_id, "document workflow started");

    Ok((
        StatusCode::ACCEPTED,
        Json(WorkflowAccepted {
            workflow_id: req.document_id,
            status: "processing".to_string(),
        }),
    ))
}
