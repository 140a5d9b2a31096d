//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use docket_common::messages::{ANALYSIS_QUEUE, INTAKE_QUEUE, RESULTS_QUEUE};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the broker cannot be read
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// Messages waiting or in flight per queue
    pub queues: BTreeMap<&'static str, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let mut status = "ok";
    let mut queues = BTreeMap::new();
    for queue in [INTAKE_QUEUE, ANALYSIS_QUEUE, RESULTS_QUEUE] {
        match state.broker.depth(queue).await {
            Ok(depth) => {
                queues.insert(queue, depth);
            }
            Err(e) => {
                warn!(queue, error = %e, "Queue depth unavailable");
                status = "degraded";
            }
        }
    }

    let last_error = state.last_error.read().await.clone();

    Json(HealthResponse {
        status: status.to_string(),
        module: "docket".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        queues,
        last_error,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
