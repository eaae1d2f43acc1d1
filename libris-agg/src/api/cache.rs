//! Cache administration
//!
//! DELETE /cache, DELETE /cache/:identifier, GET /cache/fast

use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;

use crate::cache::FastEntrySummary;
use crate::error::{ApiError, ApiResult};
use crate::types::BookIdentifier;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub scope: String,
    pub durable_removed: u64,
}

/// DELETE /cache
pub async fn invalidate_all(State(state): State<AppState>) -> Json<InvalidateResponse> {
    let removed = state.orchestrator.invalidate_all().await;
    Json(InvalidateResponse {
        scope: "all".to_string(),
        durable_removed: removed,
    })
}

/// DELETE /cache/:identifier
pub async fn invalidate_identifier(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> ApiResult<Json<InvalidateResponse>> {
    let id: BookIdentifier = identifier.parse().map_err(ApiError::BadRequest)?;
    let removed = state.orchestrator.invalidate(&id).await;
    Ok(Json(InvalidateResponse {
        scope: id.to_string(),
        durable_removed: u64::from(removed),
    }))
}

/// GET /cache/fast
pub async fn fast_entries(State(state): State<AppState>) -> Json<Vec<FastEntrySummary>> {
    Json(state.orchestrator.fast_entries().await)
}

pub fn cache_routes() -> Router<AppState> {
    Router::new()
        .route("/cache", delete(invalidate_all))
        .route("/cache/fast", get(fast_entries))
        .route("/cache/:identifier", delete(invalidate_identifier))
}
