//! # Docket Common Library
//!
//! Shared code for the Docket API process and its stage workers:
//! - Error type and result alias
//! - Bootstrap configuration loading
//! - Store initialization and schema
//! - Queue message schemas
//! - Lifecycle events, event bus and SSE streaming
//! - Lock-contention retry

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod messages;
pub mod retry;
pub mod sse;

pub use error::{Error, Result};
