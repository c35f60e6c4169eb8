// Workflow introspection and HITL signal routes

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tessera_durable::workflow::attributes::{keys, AttributeFilter};
use utoipa::ToSchema;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DescribeResponse {
    pub workflow_id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub status: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub close_time: Option<chrono::DateTime<chrono::Utc>>,
    pub search_attributes: serde_json::Value,
    pub pending_activities: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SignalRequest {
    pub signal_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListWorkflowsParams {
    pub domain_id: Option<String>,
    pub status: Option<String>,
    pub queue: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/workflows", get(list_workflows))
        .route("/api/v1/workflows/:workflow_id", get(describe_workflow))
        .route("/api/v1/workflows/:workflow_id/status", get(workflow_status))
        .route("/api/v1/workflows/:workflow_id/results", get(workflow_results))
        .route("/api/v1/workflows/:workflow_id/signal", post(signal_workflow))
        .with_state(state)
}

/// GET /api/v1/workflows - List workflows by attribute predicate
#[utoipa::path(
    get,
    path = "/api/v1/workflows",
    params(
        ("domain_id" = Option<String>, Query, description = "Filter by tenant"),
        ("status" = Option<String>, Query, description = "Filter by Status attribute"),
        ("queue" = Option<String>, Query, description = "Filter by Queue attribute")
    ),
    responses(
        (status = 200, description = "Matching workflows", body = Vec<WorkflowSummary>)
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    _principal: Principal,
    Query(params): Query<ListWorkflowsParams>,
) -> Result<Json<Vec<WorkflowSummary>>, ApiError> {
    let records = if params.status.is_some() || params.queue.is_some() {
        let mut filter = AttributeFilter::new();
        if let Some(status) = &params.status {
            filter = filter.eq(keys::STATUS, status.as_str());
        }
        if let Some(queue) = &params.queue {
            filter = filter.eq(keys::QUEUE, queue.as_str());
        }
        if let Some(domain) = &params.domain_id {
            filter = filter.eq(keys::TENANT, domain.as_str());
        }
        state.executor.list_workflows(&filter).await?
    } else {
        state.store.list_executions(params.domain_id.as_deref()).await?
    };

    Ok(Json(
        records
            .into_iter()
            .map(|r| WorkflowSummary {
                workflow_id: r.workflow_id,
                run_id: r.run_id.to_string(),
                workflow_type: r.workflow_type,
                status: r.status.to_string(),
            })
            .collect(),
    ))
}

/// GET /api/v1/workflows/{workflow_id} - Describe an execution
#[utoipa::path(
    get,
    path = "/api/v1/workflows/{workflow_id}",
    params(("workflow_id" = String, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Execution details", body = DescribeResponse),
        (status = 404, description = "Unknown workflow")
    ),
    tag = "workflows"
)]
pub async fn describe_workflow(
    State(state): State<AppState>,
    _principal: Principal,
    Path(workflow_id): Path<String>,
) -> Result<Json<DescribeResponse>, ApiError> {
    let describe = state.executor.describe_workflow(&workflow_id, None).await?;

    Ok(Json(DescribeResponse {
        workflow_id: describe.record.workflow_id,
        run_id: describe.record.run_id.to_string(),
        workflow_type: describe.record.workflow_type,
        status: describe.record.status.to_string(),
        start_time: describe.record.started_at,
        close_time: describe.record.closed_at,
        search_attributes: serde_json::to_value(&describe.search_attributes)
            .unwrap_or(serde_json::Value::Null),
        pending_activities: describe.pending_activities,
    }))
}

/// GET /api/v1/workflows/{workflow_id}/status
#[utoipa::path(
    get,
    path = "/api/v1/workflows/{workflow_id}/status",
    params(("workflow_id" = String, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Current status"),
        (status = 404, description = "Unknown workflow")
    ),
    tag = "workflows"
)]
pub async fn workflow_status(
    State(state): State<AppState>,
    _principal: Principal,
    Path(workflow_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let describe = state.executor.describe_workflow(&workflow_id, None).await?;

    Ok(Json(json!({
        "status": describe.record.status.to_string(),
        "type": describe.record.workflow_type,
    })))
}

/// GET /api/v1/workflows/{workflow_id}/results
#[utoipa::path(
    get,
    path = "/api/v1/workflows/{workflow_id}/results",
    params(("workflow_id" = String, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Result when completed; null otherwise"),
        (status = 404, description = "Unknown workflow")
    ),
    tag = "workflows"
)]
pub async fn workflow_results(
    State(state): State<AppState>,
    _principal: Principal,
    Path(workflow_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let describe = state.executor.describe_workflow(&workflow_id, None).await?;
    let record = describe.record;

    let body = match record.status {
        tessera_durable::WorkflowStatus::Completed => json!({
            "result": record.result,
        }),
        status => json!({
            "result": null,
            "message": format!("workflow is {status}"),
        }),
    };

    Ok(Json(body))
}

/// POST /api/v1/workflows/{workflow_id}/signal - Deliver a signal
#[utoipa::path(
    post,
    path = "/api/v1/workflows/{workflow_id}/signal",
    params(("workflow_id" = String, Path, description = "Workflow ID")),
    request_body = SignalRequest,
    responses(
        (status = 200, description = "Signal delivered"),
        (status = 404, description = "Unknown workflow"),
        (status = 409, description = "Workflow already closed"),
        (status = 429, description = "Signal channel full")
    ),
    tag = "workflows"
)]
pub async fn signal_workflow(
    State(state): State<AppState>,
    _principal: Principal,
    Path(workflow_id): Path<String>,
    Json(req): Json<SignalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.signal_name.is_empty() {
        return Err(ApiError::Validation("signal_name must not be empty".into()));
    }

    state
        .executor
        .signal_workflow(&workflow_id, None, &req.signal_name, req.payload)
        .await?;

    Ok(Json(json!({"delivered": true})))
}
