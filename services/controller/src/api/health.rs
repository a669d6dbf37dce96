//! Health check endpoints.
//!
//! These endpoints are used by load balancers and orchestration systems
//! to determine if the controller is healthy and ready.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use steward_reconcile::ProcessCondition;

use crate::state::AppState;

const SERVICE: &str = "steward-controller";

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Detailed component health (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

/// Component health details.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Desired-state store reachability.
    pub desired_store: ComponentStatus,
}

/// Individual component status.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentStatus {
    /// Status: "ok" or "unavailable".
    pub status: String,

    /// Optional message with details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the component became unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Basic health check - is the service running?
///
/// Does not check dependencies.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Readiness check - is reconciliation running?
///
/// Returns 503 while reconciliation is paused on a systemic failure.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let condition = state.status().condition().await;

    let desired_store = match &condition {
        ProcessCondition::Healthy => ComponentStatus {
            status: "ok".to_string(),
            message: None,
            since: None,
        },
        ProcessCondition::Degraded { message, since } => ComponentStatus {
            status: "unavailable".to_string(),
            message: Some(message.clone()),
            since: Some(since.to_rfc3339()),
        },
    };

    let ready = condition.is_healthy();
    let response = HealthResponse {
        status: if ready { "ok" } else { "degraded" }.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(ComponentHealth { desired_store }),
    };

    if ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Liveness check - is the service alive?
///
/// Returns 200 with an empty body.
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
