use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;

use crate::state::AppState;

/// Liveness plus a check that the upload root is still mounted.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let storage_ready = state.config.upload_root.is_dir();
    let status = if storage_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if storage_ready { "ok" } else { "degraded" },
            "storage": storage_ready,
        })),
    )
}
