//! List import endpoints
//!
//! POST /lists/import, GET /lists/jobs, GET /lists/jobs/:id,
//! POST /lists/jobs/:id/cancel

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::import::ImportJob;
use crate::AppState;

const RECENT_JOBS: i64 = 50;

/// POST /lists/import request
#[derive(Debug, Deserialize)]
pub struct ImportListRequest {
    pub url: String,
}

/// POST /lists/import response
#[derive(Debug, Serialize)]
pub struct ImportListResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// POST /lists/jobs/:id/cancel response
#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub job_id: Uuid,
    pub cancellation_requested: bool,
}

/// POST /lists/import
///
/// Queue an import job. Returns 202 Accepted with the job id.
pub async fn import_list(
    State(state): State<AppState>,
    Json(request): Json<ImportListRequest>,
) -> ApiResult<(StatusCode, Json<ImportListResponse>)> {
    if request.url.trim().is_empty() {
        return Err(ApiError::BadRequest("url is required".to_string()));
    }

    let job_id = state.jobs.submit(&request.url).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ImportListResponse {
            job_id,
            status: "queued".to_string(),
        }),
    ))
}

/// GET /lists/jobs
pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<ImportJob>>> {
    Ok(Json(state.jobs.recent(RECENT_JOBS).await?))
}

/// GET /lists/jobs/:id
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<ImportJob>> {
    state
        .jobs
        .status(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("import job {}", job_id)))
}

/// POST /lists/jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<CancelJobResponse>> {
    if state.jobs.status(job_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("import job {}", job_id)));
    }

    Ok(Json(CancelJobResponse {
        job_id,
        cancellation_requested: state.jobs.cancel(job_id),
    }))
}

pub fn list_routes() -> Router<AppState> {
    Router::new()
        .route("/lists/import", post(import_list))
        .route("/lists/jobs", get(list_jobs))
        .route("/lists/jobs/:id", get(job_status))
        .route("/lists/jobs/:id/cancel", post(cancel_job))
}
