//! Multipart job submission
//!
//! Form fields: `target_text` (new jobs only), `use_rate_limit`
//! (`true`/`false`, optional) and one or more `files`.

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use tracing::{debug, info};

use crate::coordinator::{AddItemsReport, SubmitReport};
use crate::staging::Upload;
use crate::{ApiError, ApiResult, AppState};

/// Parsed submission form
#[derive(Debug, Default)]
struct SubmissionForm {
    target_text: Option<String>,
    use_rate_limit: bool,
    uploads: Vec<Upload>,
}

async fn read_form(mut multipart: Multipart) -> ApiResult<SubmissionForm> {
    let mut form = SubmissionForm::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "target_text" => {
                form.target_text = Some(field.text().await.map_err(bad_multipart)?);
            }
            "use_rate_limit" => {
                let value = field.text().await.map_err(bad_multipart)?;
                form.use_rate_limit = parse_flag(&value)?;
            }
            "files" | "files[]" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                form.uploads.push(Upload {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            other => debug!(field = other, "Ignoring unknown form field"),
        }
    }

    Ok(form)
}

fn parse_flag(value: &str) -> ApiResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "false" | "0" | "off" => Ok(false),
        "true" | "1" | "on" => Ok(true),
        other => Err(ApiError::BadRequest(format!("use_rate_limit must be a boolean, got '{}'", other))),
    }
}

fn bad_multipart(e: MultipartError) -> ApiError {
    ApiError::BadRequest(format!("malformed multipart body: {}", e))
}

/// POST /jobs/submit
pub async fn submit_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<SubmitReport>)> {
    let form = read_form(multipart).await?;
    let target_text = form
        .target_text
        .ok_or_else(|| ApiError::BadRequest("target_text is required".into()))?;

    info!(files = form.uploads.len(), use_rate_limit = form.use_rate_limit, "Submission received");
    let report = state
        .coordinator
        .submit(&target_text, form.use_rate_limit, form.uploads)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// POST /jobs/:id/items
pub async fn add_items(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<AddItemsReport>)> {
    let form = read_form(multipart).await?;
    info!(%job_id, files = form.uploads.len(), "Incremental submission received");
    let report = state
        .coordinator
        .add_items(&job_id, form.use_rate_limit, form.uploads)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

pub fn submit_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/submit", post(submit_job))
        .route("/jobs/:id/items", post(add_items))
}
