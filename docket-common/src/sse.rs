//! Server-Sent Events (SSE) utilities

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::events::{DocketEvent, EventBus};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Stream lifecycle events from `bus`, optionally restricted to one job
///
/// Sends a `ConnectionStatus` event first, then every matching event as JSON
/// named by [`DocketEvent::event_type`]. A lagging client skips the events it
/// missed and keeps streaming.
pub fn create_event_sse_stream(
    bus: &EventBus,
    job_filter: Option<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(job_filter = ?job_filter, "New SSE client connected to job events");

    let mut rx = bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                received = rx.recv() => {
                    match received {
                        Ok(event) if matches_filter(&event, job_filter.as_deref()) => {
                            let event_type = event.event_type();
                            match serde_json::to_string(&event) {
                                Ok(event_json) => {
                                    yield Ok(Event::default()
                                        .event(event_type)
                                        .data(event_json));
                                }
                                Err(e) => {
                                    warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "SSE: client lagged, events dropped");
                        }
                        Err(RecvError::Closed) => {
                            info!("SSE: event bus closed, ending stream");
                            break;
                        }
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}

fn matches_filter(event: &DocketEvent, job_filter: Option<&str>) -> bool {
    job_filter.map_or(true, |job_id| event.job_id() == job_id)
}
