//! Common error types for Docket

use thiserror::Error;

/// Common result type for Docket operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the pipeline stages and the API
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested job or item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create collided with an existing record
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Malformed message or invalid request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Status change not permitted by the job lifecycle
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Broker or store unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the failure is the store or broker being unreachable,
    /// as opposed to a problem with the request itself.
    pub fn is_connection(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Database(db_err) => matches!(
                db_err,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// True for SQLite lock contention that is worth retrying
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(db_err) => {
                let msg = db_err.to_string();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}
