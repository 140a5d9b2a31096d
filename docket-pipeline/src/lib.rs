//! docket-pipeline library interface
//!
//! The `docket` binary wires these pieces together; integration tests use
//! them directly.

pub mod api;
pub mod broker;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod migration;
pub mod models;
pub mod stages;
pub mod staging;
pub mod workers;

pub use crate::error::{ApiError, ApiResult};

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use docket_common::events::EventBus;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::broker::MessageBroker;
use crate::coordinator::Coordinator;
use crate::db::{Archive, Ledger};
use crate::migration::MigrationEngine;

/// Largest number of files one multipart request is sized for
const MAX_FILES_PER_REQUEST: u64 = 50;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub migration: MigrationEngine,
    pub broker: Arc<dyn MessageBroker>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        coordinator: Coordinator,
        migration: MigrationEngine,
        broker: Arc<dyn MessageBroker>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            coordinator,
            migration,
            broker,
            event_bus,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        self.coordinator.ledger()
    }

    pub fn archive(&self) -> &Archive {
        self.coordinator.archive()
    }

    /// Remember an error for `/health`
    pub async fn note_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    let upload_limit = state
        .coordinator
        .staging()
        .limits()
        .max_file_bytes
        .saturating_mul(MAX_FILES_PER_REQUEST);
    let upload_limit = usize::try_from(upload_limit).unwrap_or(usize::MAX);

    Router::new()
        .merge(api::submit_routes().layer(DefaultBodyLimit::max(upload_limit)))
        .merge(api::job_routes())
        .merge(api::results_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
