//! Structured store: archived jobs and their items
//!
//! Items are unique on `(job_id, item_id)`. Aggregate counters on the job
//! row are recomputed from item rows inside the same transaction that
//! changes them, so they never drift from the table contents.

use chrono::{DateTime, Utc};
use docket_common::messages::{Outcome, ScoreCard};
use docket_common::retry::retry_on_lock;
use docket_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use tracing::info;

use crate::models::{ArchivedJob, ArchivedJobView, ItemRecord, JobStatus, PendingJob};
use crate::staging::parse_item_index;

/// Counters after an archive write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveCounts {
    pub total: u64,
    pub success_count: u64,
    pub error_count: u64,
}

#[derive(Clone)]
pub struct Archive {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl Archive {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Item ids already archived for `job_id` (empty if the job is not archived)
    pub async fn archived_item_ids(&self, job_id: &str) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT item_id FROM archived_items WHERE job_id = ?")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Index for the next item added to an archived job, or `None` if the job
    /// is not archived. Never reuses an index, even after an item is erased.
    pub async fn next_item_index(&self, job_id: &str) -> Result<Option<u64>> {
        let Some(job) = self.find_job(job_id).await? else {
            return Ok(None);
        };

        let ids = self.archived_item_ids(job_id).await?;
        let max_index = ids.iter().filter_map(|id| parse_item_index(id)).max();
        let next = max_index.map_or(0, |i| i + 1).max(job.total);
        Ok(Some(next))
    }

    pub async fn find_job(&self, job_id: &str) -> Result<Option<ArchivedJob>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, correlation_id, target_text, status, total, success_count,
                   error_count, created_at, completed_at, archived_at
            FROM archived_jobs
            WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_archived_job).transpose()
    }

    /// Archived job with items, best match first, errors last
    pub async fn get_job_with_items(&self, job_id: &str) -> Result<ArchivedJobView> {
        let job = self
            .find_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("archived job {}", job_id)))?;

        let rows = sqlx::query(
            r#"
            SELECT item_id, display_name, outcome, payload, error, recorded_at
            FROM archived_items
            WHERE job_id = ?
            ORDER BY match_score IS NULL, match_score DESC, item_id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .iter()
            .map(row_to_item)
            .collect::<Result<Vec<_>>>()?;

        Ok(ArchivedJobView { job, items })
    }

    /// Write `items` for `job` and refresh its counters in one transaction.
    ///
    /// Items whose id is already archived are skipped by the unique
    /// constraint. Either everything commits or nothing does.
    pub async fn write_batch(&self, job: &PendingJob, items: &[ItemRecord]) -> Result<ArchiveCounts> {
        // Serialize up front so a bad payload fails before the transaction opens
        let mut prepared = Vec::with_capacity(items.len());
        for item in items {
            let payload = item.payload.as_ref().map(serde_json::to_string).transpose()?;
            prepared.push((item, payload));
        }
        let prepared = &prepared;

        let counts = retry_on_lock("archive_write_batch", self.max_lock_wait_ms, || async move {
            let mut tx = self.pool.begin().await?;
            let now = Utc::now().to_rfc3339();

            sqlx::query(
                r#"
                INSERT INTO archived_jobs (
                    job_id, correlation_id, target_text, status,
                    created_at, completed_at, archived_at
                ) VALUES (?, ?, ?, 'archived', ?, ?, ?)
                ON CONFLICT(job_id) DO UPDATE SET
                    status = 'archived',
                    completed_at = excluded.completed_at,
                    archived_at = excluded.archived_at
                "#,
            )
            .bind(&job.job_id)
            .bind(&job.correlation_id)
            .bind(&job.target_text)
            .bind(job.created_at.to_rfc3339())
            .bind(job.completed_at.map(|dt| dt.to_rfc3339()))
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            for (item, payload) in prepared {
                sqlx::query(
                    r#"
                    INSERT INTO archived_items (
                        job_id, item_id, display_name, outcome, match_score,
                        payload, error, recorded_at, archived_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(job_id, item_id) DO NOTHING
                    "#,
                )
                .bind(&job.job_id)
                .bind(&item.item_id)
                .bind(&item.display_name)
                .bind(item.outcome.as_str())
                .bind(item.match_score().map(i64::from))
                .bind(payload.as_deref())
                .bind(item.error.as_deref())
                .bind(item.recorded_at.to_rfc3339())
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }

            let counts = refresh_counters(&mut tx, &job.job_id).await?;
            tx.commit().await?;
            Ok::<_, Error>(counts)
        })
        .await?;

        info!(
            job_id = %job.job_id,
            written = items.len(),
            total = counts.total,
            success = counts.success_count,
            errors = counts.error_count,
            "Archive batch committed"
        );
        Ok(counts)
    }

    /// Erase one archived item and refresh the job counters
    pub async fn delete_item(&self, job_id: &str, item_id: &str) -> Result<ArchiveCounts> {
        let counts = retry_on_lock("archive_delete_item", self.max_lock_wait_ms, || async move {
            let mut tx = self.pool.begin().await?;

            let deleted = sqlx::query("DELETE FROM archived_items WHERE job_id = ? AND item_id = ?")
                .bind(job_id)
                .bind(item_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            if deleted == 0 {
                return Err(Error::NotFound(format!("item {} in job {}", item_id, job_id)));
            }

            let counts = refresh_counters(&mut tx, job_id).await?;
            tx.commit().await?;
            Ok::<_, Error>(counts)
        })
        .await?;

        info!(job_id, item_id, total = counts.total, "Archived item erased");
        Ok(counts)
    }
}

async fn refresh_counters(tx: &mut Transaction<'_, Sqlite>, job_id: &str) -> Result<ArchiveCounts> {
    let row = sqlx::query(
        r#"
        UPDATE archived_jobs
        SET total = (SELECT COUNT(*) FROM archived_items WHERE job_id = ?1),
            success_count = (SELECT COUNT(*) FROM archived_items WHERE job_id = ?1 AND outcome = 'success'),
            error_count = (SELECT COUNT(*) FROM archived_items WHERE job_id = ?1 AND outcome = 'error')
        WHERE job_id = ?1
        RETURNING total, success_count, error_count
        "#,
    )
    .bind(job_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(ArchiveCounts {
        total: row.get::<i64, _>("total") as u64,
        success_count: row.get::<i64, _>("success_count") as u64,
        error_count: row.get::<i64, _>("error_count") as u64,
    })
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

fn row_to_archived_job(row: &SqliteRow) -> Result<ArchivedJob> {
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let completed_at: Option<String> = row.get("completed_at");
    let archived_at: String = row.get("archived_at");

    Ok(ArchivedJob {
        job_id: row.get("job_id"),
        correlation_id: row.get("correlation_id"),
        target_text: row.get("target_text"),
        status: status.parse::<JobStatus>()?,
        total: row.get::<i64, _>("total") as u64,
        success_count: row.get::<i64, _>("success_count") as u64,
        error_count: row.get::<i64, _>("error_count") as u64,
        created_at: parse_timestamp("created_at", &created_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|s| parse_timestamp("completed_at", s))
            .transpose()?,
        archived_at: parse_timestamp("archived_at", &archived_at)?,
    })
}

fn row_to_item(row: &SqliteRow) -> Result<ItemRecord> {
    let outcome: String = row.get("outcome");
    let outcome = match outcome.as_str() {
        "success" => Outcome::Success,
        "error" => Outcome::Error,
        other => return Err(Error::Internal(format!("unknown outcome '{}'", other))),
    };
    let payload: Option<String> = row.get("payload");
    let payload = payload
        .as_deref()
        .map(serde_json::from_str::<ScoreCard>)
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to deserialize payload: {}", e)))?;
    let recorded_at: String = row.get("recorded_at");

    Ok(ItemRecord {
        item_id: row.get("item_id"),
        display_name: row.get("display_name"),
        outcome,
        payload,
        error: row.get("error"),
        recorded_at: parse_timestamp("recorded_at", &recorded_at)?,
    })
}
