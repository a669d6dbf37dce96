//! Reconciliation status endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use steward_id::{Generation, ResourceKey, ResourceKind};
use steward_reconcile::{
    ProcessCondition, ReconcileError, ReconciliationStatus, ResourceStatus, StatusSummary,
};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(list_status))
        .route("/status/{kind}/{namespace}/{name}", get(get_status))
        .route("/status/{kind}/{namespace}/{name}/retry", post(retry))
}

#[derive(Debug, Deserialize)]
pub struct ListStatusQuery {
    /// Only return resources in this status.
    pub status: Option<ReconciliationStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListStatusResponse {
    pub condition: ProcessCondition,
    pub summary: StatusSummary,
    pub items: Vec<ResourceStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub key: ResourceKey,
    pub generation: Generation,
}

fn parse_key(
    request_id: &str,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<ResourceKey, ApiError> {
    ResourceKind::parse(kind)
        .and_then(|kind| ResourceKey::new(kind, namespace, name))
        .map_err(|e| {
            ApiError::bad_request("invalid_resource_key", e.to_string()).with_request_id(request_id)
        })
}

/// List the status of every tracked resource.
///
/// GET /v1/status
async fn list_status(
    State(state): State<AppState>,
    Query(query): Query<ListStatusQuery>,
) -> impl IntoResponse {
    let status = state.status();
    let mut items = status.list().await;
    if let Some(wanted) = query.status {
        items.retain(|item| item.status == wanted);
    }

    Json(ListStatusResponse {
        condition: status.condition().await,
        summary: status.summary().await,
        items,
    })
}

/// Get the status of one resource.
///
/// GET /v1/status/{kind}/{namespace}/{name}
async fn get_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&ctx.request_id, &kind, &namespace, &name)?;

    match state.status().get(&key).await {
        Some(status) => Ok(Json(status)),
        None => Err(
            ApiError::not_found("resource_not_found", format!("No status for {key}"))
                .with_request_id(ctx.request_id),
        ),
    }
}

/// Force a retry of the current generation, resetting its retry budget.
///
/// POST /v1/status/{kind}/{namespace}/{name}/retry
async fn retry(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&ctx.request_id, &kind, &namespace, &name)?;

    let generation = state
        .reconciler()
        .force_retry(&key)
        .await
        .map_err(|e| match e {
            ReconcileError::NotDeclared(_) => {
                ApiError::not_found("resource_not_declared", e.to_string())
                    .with_request_id(ctx.request_id.clone())
            }
            other => {
                tracing::error!(error = %other, request_id = %ctx.request_id, "Failed to schedule retry");
                ApiError::internal("internal_error", "Failed to schedule retry")
                    .with_request_id(ctx.request_id.clone())
            }
        })?;

    info!(key = %key, generation = %generation, request_id = %ctx.request_id, "Retry scheduled");
    Ok((StatusCode::ACCEPTED, Json(RetryResponse { key, generation })))
}
