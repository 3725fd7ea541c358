//! HTTP request handlers.

use super::AppState;
use crate::scheduler::PushError;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

// ============================================================================
// Push ingress
// ============================================================================

pub async fn handle_push(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.heartbeat.record_push(&token).await {
        Ok(target) => {
            tracing::debug!("Push accepted for {}", target.name);
            Json(json!({ "ok": true, "msg": "Heartbeat received" })).into_response()
        }
        Err(e @ PushError::NotFound) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e @ PushError::Inactive) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(PushError::Db(e)) => {
            tracing::error!("Push handling failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "active_targets": state.scheduler.active_count().await,
    }))
}
