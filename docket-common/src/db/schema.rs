//! Table definitions for the three stores
//!
//! All statements are `IF NOT EXISTS` so every process may run them at startup.

use crate::Result;
use sqlx::SqlitePool;

/// Pending store: one row per in-flight job.
///
/// `results` and `errors` are JSON arrays of item records. Their lengths are
/// the success and error counts, so a single row update both appends an item
/// and advances the fan-in counter. `item_offset` is the first item index of
/// the entry (non-zero when a job is re-opened from the structured store).
pub async fn create_pending_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_jobs (
            job_id TEXT PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            target_text TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'complete', 'archived')),
            expected_files INTEGER NOT NULL CHECK (expected_files >= 0),
            item_offset INTEGER NOT NULL DEFAULT 0,
            results TEXT NOT NULL DEFAULT '[]',
            errors TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pending_jobs_status ON pending_jobs(status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Structured store: job row plus item rows unique on `(job_id, item_id)`
pub async fn create_archive_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS archived_jobs (
            job_id TEXT PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            target_text TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'archived',
            total INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            archived_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS archived_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL REFERENCES archived_jobs(job_id) ON DELETE CASCADE,
            item_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK (outcome IN ('success', 'error')),
            match_score INTEGER,
            payload TEXT,
            error TEXT,
            recorded_at TEXT NOT NULL,
            archived_at TEXT NOT NULL,
            UNIQUE (job_id, item_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_archived_items_score ON archived_items(job_id, match_score DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Broker: one row per undelivered or in-flight message.
///
/// A claimed row carries a lease deadline (unix millis). Acknowledgement
/// deletes the row; an expired lease makes it claimable again.
pub async fn create_broker_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            body TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            claimed_by TEXT,
            lease_until INTEGER,
            deliveries INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_messages_queue ON queue_messages(queue, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
