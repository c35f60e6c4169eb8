// Per-principal signal inbox routes

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tessera_durable::persistence::InboxSignal;
use utoipa::ToSchema;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct InboxParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/inbox/signals", get(list_signals))
        .route("/api/v1/inbox/signals/unread-count", get(unread_count))
        .route("/api/v1/inbox/signals/:sequence/read", post(mark_read))
        .with_state(state)
}

/// GET /api/v1/inbox/signals - Page through the caller's inbox
#[utoipa::path(
    get,
    path = "/api/v1/inbox/signals",
    params(
        ("limit" = Option<u32>, Query, description = "Page size (default 50)"),
        ("offset" = Option<u32>, Query, description = "Page offset")
    ),
    responses((status = 200, description = "Inbox page, newest first")),
    tag = "inbox"
)]
pub async fn list_signals(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<InboxParams>,
) -> Result<Json<Vec<InboxSignal>>, ApiError> {
    let signals = state
        .store
        .list_inbox(&principal.subject, params.limit.min(200), params.offset)
        .await?;
    Ok(Json(signals))
}

/// GET /api/v1/inbox/signals/unread-count
#[utoipa::path(
    get,
    path = "/api/v1/inbox/signals/unread-count",
    responses((status = 200, description = "Unread signal count")),
    tag = "inbox"
)]
pub async fn unread_count(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = state.store.unread_inbox_count(&principal.subject).await?;
    Ok(Json(json!({"unread": count})))
}

/// POST /api/v1/inbox/signals/{sequence}/read - Mark one signal read
#[utoipa::path(
    post,
    path = "/api/v1/inbox/signals/{sequence}/read",
    params(("sequence" = i64, Path, description = "Inbox sequence number")),
    responses(
        (status = 200, description = "Marked read"),
        (status = 404, description = "Unknown sequence")
    ),
    tag = "inbox"
)]
pub async fn mark_read(
    State(state): State<AppState>,
    principal: Principal,
    Path(sequence): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let found = state
        .store
        .mark_inbox_read(&principal.subject, sequence)
        .await?;

    if !found {
        return Err(ApiError::NotFound(format!("unknown inbox signal: {sequence}")));
    }

    Ok(Json(json!({"read": true})))
}
