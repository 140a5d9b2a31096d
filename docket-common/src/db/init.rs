//! Database initialization
//!
//! Each store is its own SQLite file. Worker processes on the same host open
//! the same files, so every pool runs in WAL mode with a busy timeout.

use crate::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use super::schema;

/// Busy timeout applied to every connection
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Startup connection policy: bounded attempts with a fixed interval
#[derive(Debug, Clone, Copy)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub interval: Duration,
}

impl ConnectRetry {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Single attempt, for tests and one-shot commands
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Open (creating if missing) a SQLite pool at `db_path`
///
/// Connection failures are retried per `retry`; after the last attempt the
/// failure surfaces as [`Error::Connection`].
pub async fn open_pool(db_path: &Path, retry: ConnectRetry) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let mut attempt = 0u32;
    let pool = loop {
        attempt += 1;
        match SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => break pool,
            Err(e) if attempt < retry.attempts => {
                warn!(
                    db = %db_path.display(),
                    attempt,
                    max_attempts = retry.attempts,
                    error = %e,
                    "Store connection failed, retrying"
                );
                tokio::time::sleep(retry.interval).await;
            }
            Err(e) => {
                return Err(Error::Connection(format!(
                    "{} unreachable after {} attempts: {}",
                    db_path.display(),
                    attempt,
                    e
                )));
            }
        }
    };

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    Ok(pool)
}

/// Open the pending store and create its tables
pub async fn init_pending_store(db_path: &Path, retry: ConnectRetry) -> Result<SqlitePool> {
    let pool = open_pool(db_path, retry).await?;
    schema::create_pending_tables(&pool).await?;
    Ok(pool)
}

/// Open the structured store and create its tables
pub async fn init_archive_store(db_path: &Path, retry: ConnectRetry) -> Result<SqlitePool> {
    let pool = open_pool(db_path, retry).await?;
    schema::create_archive_tables(&pool).await?;
    Ok(pool)
}

/// Open the broker database and create the queue table
pub async fn init_broker_store(db_path: &Path, retry: ConnectRetry) -> Result<SqlitePool> {
    let pool = open_pool(db_path, retry).await?;
    schema::create_broker_tables(&pool).await?;
    Ok(pool)
}
