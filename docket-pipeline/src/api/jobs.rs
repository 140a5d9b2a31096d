//! Ledger operations and migration trigger
//!
//! - `POST   /jobs`                create a pending entry
//! - `GET    /jobs/:id`            pending snapshot, else archived record
//! - `PATCH  /jobs/:id/expected`   grow the expected item count
//! - `PATCH  /jobs/:id/status`     lifecycle-checked status change
//! - `DELETE /jobs/:id`            drop the pending entry
//! - `POST   /jobs/:id/sync`       migrate a complete job

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::migration::MigrationReport;
use crate::models::{JobStatus, JobView, PendingJob};
use crate::staging::validate_job_id;
use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub job_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub target_text: String,
    pub expected_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct IncreaseExpectedRequest {
    pub delta: u64,
}

#[derive(Debug, Serialize)]
pub struct IncreaseExpectedResponse {
    pub job_id: String,
    pub first_index: u64,
    pub expected_files: u64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

/// POST /jobs
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<PendingJob>)> {
    validate_job_id(&request.job_id)?;
    let correlation_id = request
        .correlation_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let job = state
        .ledger()
        .create(
            &request.job_id,
            &correlation_id,
            &request.target_text,
            request.expected_count,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.coordinator.job_view(&job_id).await?))
}

/// PATCH /jobs/:id/expected
pub async fn increase_expected(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<IncreaseExpectedRequest>,
) -> ApiResult<Json<IncreaseExpectedResponse>> {
    let slot = state.ledger().increase_expected(&job_id, request.delta).await?;
    Ok(Json(IncreaseExpectedResponse {
        job_id,
        first_index: slot.first_index,
        expected_files: slot.expected_files,
    }))
}

/// PATCH /jobs/:id/status
pub async fn update_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<Json<PendingJob>> {
    let status: JobStatus = request.status.parse()?;
    let job = state.ledger().update_status(&job_id, status).await?;
    Ok(Json(job))
}

/// DELETE /jobs/:id
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.ledger().delete(&job_id).await?;
    if let Err(e) = state.coordinator.staging().remove_job(&job_id).await {
        warn!(%job_id, error = %e, "Failed to remove staging directory of deleted job");
    }
    info!(%job_id, "Job deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /jobs/:id/sync
pub async fn sync_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<MigrationReport>> {
    match state.migration.migrate(&job_id).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            state.note_error(format!("sync {}: {}", job_id, e)).await;
            Err(ApiError::from(e))
        }
    }
}

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/jobs/:id/expected", patch(increase_expected))
        .route("/jobs/:id/status", patch(update_status))
        .route("/jobs/:id/sync", post(sync_job))
}
