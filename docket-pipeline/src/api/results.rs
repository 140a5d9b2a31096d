//! Archive queries

use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;

use crate::models::ArchivedJobView;
use crate::{ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct ItemDeletedResponse {
    pub job_id: String,
    pub item_id: String,
    pub total: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// GET /jobs/:id/results
///
/// Archived job with items ordered best match first.
pub async fn get_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ArchivedJobView>> {
    Ok(Json(state.archive().get_job_with_items(&job_id).await?))
}

/// DELETE /jobs/:id/items/:item_id
///
/// Erases one archived item; the job counters follow.
pub async fn delete_item(
    State(state): State<AppState>,
    Path((job_id, item_id)): Path<(String, String)>,
) -> ApiResult<Json<ItemDeletedResponse>> {
    let counts = state.archive().delete_item(&job_id, &item_id).await?;
    Ok(Json(ItemDeletedResponse {
        job_id,
        item_id,
        total: counts.total,
        success_count: counts.success_count,
        error_count: counts.error_count,
    }))
}

pub fn results_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/:id/results", get(get_results))
        .route("/jobs/:id/items/:item_id", delete(delete_item))
}
