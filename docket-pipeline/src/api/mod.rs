//! HTTP API handlers
//!
//! REST endpoints for job submission, ledger operations, migration and
//! archive queries, plus an SSE stream of lifecycle events.

pub mod health;
pub mod jobs;
pub mod results;
pub mod sse;
pub mod submit;

pub use health::health_routes;
pub use jobs::job_routes;
pub use results::results_routes;
pub use sse::event_stream;
pub use submit::submit_routes;
