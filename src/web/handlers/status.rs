//! Stream status and health endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::web::AppState;

/// Liveness plus media-tool availability, probed once at startup.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "media_tool": state.media_tool,
    }))
}

/// Stats for every session with subscribers and a running upstream.
pub async fn list_streams(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list_active().await)
}

/// Stats for a single session by key, or 404.
pub async fn stream_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&id).await {
        Some(session) => Json(session.stats().await).into_response(),
        None => (StatusCode::NOT_FOUND, "Stream not found").into_response(),
    }
}
