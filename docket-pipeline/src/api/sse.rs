//! Server-Sent Events for job lifecycle updates

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    /// Only stream events for this job
    pub job_id: Option<String>,
}

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    docket_common::sse::create_event_sse_stream(&state.event_bus, query.job_id)
}
