//! Pending store: authoritative in-flight job state
//!
//! Every mutation is a single conditional SQL statement so that any number of
//! worker processes can share one pending database. There are no in-process
//! locks; SQLite serializes writers and the `WHERE` clauses carry the invariants:
//!
//! - `success + error <= expected_files` (append refused once the job is full)
//! - an item id is recorded at most once per job
//! - the `pending → complete` flip happens in exactly one statement execution

use chrono::{DateTime, Utc};
use docket_common::retry::retry_on_lock;
use docket_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::models::{ItemCounts, ItemRecord, JobStatus, PendingJob, RecordOutcome};

/// Result of growing a job's expected count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedSlot {
    /// Index of the first newly reserved item
    pub first_index: u64,
    /// Expected count after the increase
    pub expected_files: u64,
}

/// Handle on the pending store
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

const SELECT_JOB: &str = r#"
    SELECT job_id, correlation_id, target_text, status, expected_files, item_offset,
           results, errors, created_at, completed_at
    FROM pending_jobs
    WHERE job_id = ?
"#;

impl Ledger {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new pending job. `AlreadyExists` if `job_id` is present.
    pub async fn create(
        &self,
        job_id: &str,
        correlation_id: &str,
        target_text: &str,
        expected_count: u64,
    ) -> Result<PendingJob> {
        self.insert(job_id, correlation_id, target_text, expected_count, 0)
            .await
    }

    /// Insert a pending entry for a job whose earlier items are archived.
    /// New item indices start at `item_offset`.
    pub async fn create_resumed(
        &self,
        job_id: &str,
        correlation_id: &str,
        target_text: &str,
        expected_count: u64,
        item_offset: u64,
    ) -> Result<PendingJob> {
        self.insert(job_id, correlation_id, target_text, expected_count, item_offset)
            .await
    }

    async fn insert(
        &self,
        job_id: &str,
        correlation_id: &str,
        target_text: &str,
        expected_count: u64,
        item_offset: u64,
    ) -> Result<PendingJob> {
        if expected_count == 0 {
            return Err(Error::InvalidInput("expected_count must be at least 1".into()));
        }

        let pool = &self.pool;
        let created_at = Utc::now();
        let created_at_str = created_at.to_rfc3339();
        let created_ref = created_at_str.as_str();

        let inserted = retry_on_lock("ledger_create", self.max_lock_wait_ms, || async move {
            let result = sqlx::query(
                r#"
                INSERT INTO pending_jobs (
                    job_id, correlation_id, target_text, status,
                    expected_files, item_offset, results, errors, created_at
                ) VALUES (?, ?, ?, 'pending', ?, ?, '[]', '[]', ?)
                ON CONFLICT(job_id) DO NOTHING
                "#,
            )
            .bind(job_id)
            .bind(correlation_id)
            .bind(target_text)
            .bind(expected_count as i64)
            .bind(item_offset as i64)
            .bind(created_ref)
            .execute(pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if inserted == 0 {
            return Err(Error::AlreadyExists(format!("job {}", job_id)));
        }

        info!(job_id, correlation_id, expected_count, item_offset, "Pending job created");

        Ok(PendingJob {
            job_id: job_id.to_string(),
            correlation_id: correlation_id.to_string(),
            target_text: target_text.to_string(),
            status: JobStatus::Pending,
            expected_files: expected_count,
            item_offset,
            results: Vec::new(),
            errors: Vec::new(),
            created_at,
            completed_at: None,
        })
    }

    /// Atomically add `delta` to the expected count.
    ///
    /// A `complete` entry is no longer complete once it expects more items,
    /// so the same statement moves it back to `pending`.
    pub async fn increase_expected(&self, job_id: &str, delta: u64) -> Result<ExpectedSlot> {
        if delta == 0 {
            return Err(Error::InvalidInput("delta must be at least 1".into()));
        }

        let pool = &self.pool;
        let delta = delta as i64;

        let row = retry_on_lock("ledger_increase_expected", self.max_lock_wait_ms, || async move {
            let row = sqlx::query(
                r#"
                UPDATE pending_jobs
                SET expected_files = expected_files + ?,
                    status = 'pending',
                    completed_at = NULL
                WHERE job_id = ?
                RETURNING item_offset + expected_files - ? AS first_index, expected_files
                "#,
            )
            .bind(delta)
            .bind(job_id)
            .bind(delta)
            .fetch_optional(pool)
            .await?;
            Ok::<_, Error>(row)
        })
        .await?;

        let row = row.ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        let slot = ExpectedSlot {
            first_index: row.get::<i64, _>("first_index") as u64,
            expected_files: row.get::<i64, _>("expected_files") as u64,
        };

        info!(job_id, delta, expected = slot.expected_files, "Expected count increased");
        Ok(slot)
    }

    /// Append one item outcome to the job.
    ///
    /// Duplicate item ids and appends past `expected_files` are refused inside
    /// the same statement; the returned [`RecordOutcome`] says which happened.
    pub async fn record_result(&self, job_id: &str, item: &ItemRecord) -> Result<RecordOutcome> {
        let pool = &self.pool;
        let item_json = serde_json::to_string(item)?;
        let item_json = item_json.as_str();
        let outcome = item.outcome.as_str();
        let item_id = item.item_id.as_str();

        let row = retry_on_lock("ledger_record_result", self.max_lock_wait_ms, || async move {
            let row = sqlx::query(
                r#"
                UPDATE pending_jobs
                SET results = CASE WHEN ? = 'success'
                                   THEN json_insert(results, '$[#]', json(?))
                                   ELSE results END,
                    errors  = CASE WHEN ? = 'error'
                                   THEN json_insert(errors, '$[#]', json(?))
                                   ELSE errors END
                WHERE job_id = ?
                  AND json_array_length(results) + json_array_length(errors) < expected_files
                  AND NOT EXISTS (
                      SELECT 1 FROM json_each(pending_jobs.results)
                      WHERE json_extract(json_each.value, '$.item_id') = ?
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM json_each(pending_jobs.errors)
                      WHERE json_extract(json_each.value, '$.item_id') = ?
                  )
                RETURNING json_array_length(results) AS success,
                          json_array_length(errors) AS error,
                          expected_files
                "#,
            )
            .bind(outcome)
            .bind(item_json)
            .bind(outcome)
            .bind(item_json)
            .bind(job_id)
            .bind(item_id)
            .bind(item_id)
            .fetch_optional(pool)
            .await?;
            Ok::<_, Error>(row)
        })
        .await?;

        if let Some(row) = row {
            let counts = counts_from_row(&row);
            debug!(
                job_id,
                item_id,
                outcome,
                processed = counts.processed(),
                expected = counts.expected,
                "Item recorded"
            );
            return Ok(RecordOutcome::Applied(counts));
        }

        // Nothing written: find out why
        let job = self.get(job_id).await?;
        let counts = job.counts();
        if job.items().any(|existing| existing.item_id == item.item_id) {
            debug!(job_id, item_id, "Duplicate item result ignored");
            Ok(RecordOutcome::Duplicate(counts))
        } else {
            Ok(RecordOutcome::Overflow(counts))
        }
    }

    /// Flip `pending → complete` when every expected item is recorded.
    ///
    /// Returns `true` only for the call whose statement performed the flip.
    pub async fn mark_complete_if_done(&self, job_id: &str) -> Result<bool> {
        let pool = &self.pool;
        let completed_at = Utc::now().to_rfc3339();
        let completed_ref = completed_at.as_str();

        let affected = retry_on_lock("ledger_mark_complete", self.max_lock_wait_ms, || async move {
            let result = sqlx::query(
                r#"
                UPDATE pending_jobs
                SET status = 'complete', completed_at = ?
                WHERE job_id = ?
                  AND status = 'pending'
                  AND json_array_length(results) + json_array_length(errors) = expected_files
                "#,
            )
            .bind(completed_ref)
            .bind(job_id)
            .execute(pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if affected == 1 {
            info!(job_id, "Job complete");
            return Ok(true);
        }

        if !self.exists(job_id).await? {
            return Err(Error::NotFound(format!("job {}", job_id)));
        }
        Ok(false)
    }

    /// Full snapshot of a pending job
    pub async fn get(&self, job_id: &str) -> Result<PendingJob> {
        self.find(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }

    pub async fn find(&self, job_id: &str) -> Result<Option<PendingJob>> {
        let row = sqlx::query(SELECT_JOB)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_pending_job).transpose()
    }

    pub async fn exists(&self, job_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM pending_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Set the status, enforcing lifecycle rules.
    ///
    /// Only forward moves are accepted. `pending → complete` goes through the
    /// same conditional flip as [`Ledger::mark_complete_if_done`], so it
    /// succeeds only once every expected item has an outcome. `archived` is
    /// reached by migration, never by an edit to the pending entry.
    pub async fn update_status(&self, job_id: &str, status: JobStatus) -> Result<PendingJob> {
        let current = self.get(job_id).await?;
        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(Error::InvalidTransition(format!(
                "job {} cannot move from {} to {}",
                job_id, current.status, status
            )));
        }

        // Pending -> Complete is the only move left
        if !self.mark_complete_if_done(job_id).await? {
            let job = self.get(job_id).await?;
            if job.status == status {
                return Ok(job);
            }
            let counts = job.counts();
            return Err(Error::InvalidTransition(format!(
                "job {} has {} of {} outcomes recorded",
                job_id,
                counts.processed(),
                counts.expected
            )));
        }

        info!(job_id, from = current.status.as_str(), to = status.as_str(), "Job status updated");
        self.get(job_id).await
    }

    /// Remove a pending entry. `NotFound` if absent.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let pool = &self.pool;
        let affected = retry_on_lock("ledger_delete", self.max_lock_wait_ms, || async move {
            let result = sqlx::query("DELETE FROM pending_jobs WHERE job_id = ?")
                .bind(job_id)
                .execute(pool)
                .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(Error::NotFound(format!("job {}", job_id)));
        }
        info!(job_id, "Pending job deleted");
        Ok(())
    }

    /// Remove a complete entry only if it still matches `snapshot`.
    ///
    /// Returns `false` when the entry is gone or has moved on since the
    /// snapshot was read (items added, re-opened). Such an entry is left for
    /// a later migration run.
    pub async fn delete_if_unchanged(&self, snapshot: &PendingJob) -> Result<bool> {
        let pool = &self.pool;
        let job_id = snapshot.job_id.as_str();
        let expected = snapshot.expected_files as i64;
        let processed = snapshot.counts().processed() as i64;

        let affected = retry_on_lock("ledger_delete_if_unchanged", self.max_lock_wait_ms, || async move {
            let result = sqlx::query(
                r#"
                DELETE FROM pending_jobs
                WHERE job_id = ?
                  AND status = 'complete'
                  AND expected_files = ?
                  AND json_array_length(results) + json_array_length(errors) = ?
                "#,
            )
            .bind(job_id)
            .bind(expected)
            .bind(processed)
            .execute(pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if affected == 1 {
            info!(job_id, "Pending job deleted after migration");
        }
        Ok(affected == 1)
    }

    /// Ids of all jobs in `status`, oldest first
    pub async fn job_ids_with_status(&self, status: JobStatus) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT job_id FROM pending_jobs WHERE status = ? ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn counts_from_row(row: &SqliteRow) -> ItemCounts {
    ItemCounts {
        success: row.get::<i64, _>("success") as u64,
        error: row.get::<i64, _>("error") as u64,
        expected: row.get::<i64, _>("expected_files") as u64,
    }
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

fn row_to_pending_job(row: &SqliteRow) -> Result<PendingJob> {
    let status: String = row.get("status");
    let results: String = row.get("results");
    let errors: String = row.get("errors");
    let created_at: String = row.get("created_at");
    let completed_at: Option<String> = row.get("completed_at");

    let results: Vec<ItemRecord> = serde_json::from_str(&results)
        .map_err(|e| Error::Internal(format!("Failed to deserialize results: {}", e)))?;
    let errors: Vec<ItemRecord> = serde_json::from_str(&errors)
        .map_err(|e| Error::Internal(format!("Failed to deserialize errors: {}", e)))?;

    Ok(PendingJob {
        job_id: row.get("job_id"),
        correlation_id: row.get("correlation_id"),
        target_text: row.get("target_text"),
        status: status.parse()?,
        expected_files: row.get::<i64, _>("expected_files") as u64,
        item_offset: row.get::<i64, _>("item_offset") as u64,
        results,
        errors,
        created_at: parse_timestamp("created_at", &created_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|s| parse_timestamp("completed_at", s))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_common::db::{init_pending_store, ConnectRetry};
    use tempfile::TempDir;

    async fn test_ledger() -> (TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pending_store(&dir.path().join("pending.db"), ConnectRetry::once())
            .await
            .unwrap();
        (dir, Ledger::new(pool, 5000))
    }

    #[tokio::test]
    async fn test_create_duplicate_is_already_exists() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create("job-1", "corr-1", "target", 2).await.unwrap();

        let err = ledger.create("job-1", "corr-2", "target", 5).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        // Original entry untouched
        let job = ledger.get("job-1").await.unwrap();
        assert_eq!(job.expected_files, 2);
        assert_eq!(job.correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn test_increase_expected_missing_job() {
        let (_dir, ledger) = test_ledger().await;
        let err = ledger.increase_expected("nope", 1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_increase_expected_reserves_indices_and_reopens() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create_resumed("job-1", "corr", "target", 1, 3).await.unwrap();
        ledger
            .record_result("job-1", &ItemRecord::error("job-1_003", "a.pdf", "bad"))
            .await
            .unwrap();
        assert!(ledger.mark_complete_if_done("job-1").await.unwrap());

        let slot = ledger.increase_expected("job-1", 2).await.unwrap();
        assert_eq!(slot, ExpectedSlot { first_index: 4, expected_files: 3 });

        let job = ledger.get("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_record_result_is_idempotent_per_item() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create("job-1", "corr", "target", 3).await.unwrap();
        let item = ItemRecord::error("job-1_000", "a.pdf", "unreadable");

        let first = ledger.record_result("job-1", &item).await.unwrap();
        let second = ledger.record_result("job-1", &item).await.unwrap();

        assert!(matches!(first, RecordOutcome::Applied(_)));
        assert!(matches!(second, RecordOutcome::Duplicate(_)));
        assert_eq!(second.counts(), ItemCounts { success: 0, error: 1, expected: 3 });
    }

    #[tokio::test]
    async fn test_record_result_refuses_overflow() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create("job-1", "corr", "target", 1).await.unwrap();

        ledger
            .record_result("job-1", &ItemRecord::error("job-1_000", "a.pdf", "x"))
            .await
            .unwrap();
        let extra = ledger
            .record_result("job-1", &ItemRecord::error("job-1_001", "b.pdf", "x"))
            .await
            .unwrap();

        assert!(matches!(extra, RecordOutcome::Overflow(_)));
        assert_eq!(ledger.get("job-1").await.unwrap().counts().processed(), 1);
    }

    #[tokio::test]
    async fn test_record_result_missing_job() {
        let (_dir, ledger) = test_ledger().await;
        let err = ledger
            .record_result("ghost", &ItemRecord::error("x_000", "a.pdf", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_complete_only_when_done_and_only_once() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create("job-1", "corr", "target", 2).await.unwrap();

        ledger
            .record_result("job-1", &ItemRecord::error("job-1_000", "a.pdf", "x"))
            .await
            .unwrap();
        assert!(!ledger.mark_complete_if_done("job-1").await.unwrap());

        ledger
            .record_result("job-1", &ItemRecord::error("job-1_001", "b.pdf", "x"))
            .await
            .unwrap();
        assert!(ledger.mark_complete_if_done("job-1").await.unwrap());
        assert!(!ledger.mark_complete_if_done("job-1").await.unwrap());

        let job = ledger.get("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_status_rejects_illegal_move() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create("job-1", "corr", "target", 1).await.unwrap();

        let err = ledger
            .update_status("job-1", JobStatus::Archived)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));

        // Outstanding items: cannot be declared complete
        let err = ledger
            .update_status("job-1", JobStatus::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));

        ledger
            .record_result("job-1", &ItemRecord::error("job-1_000", "a.pdf", "x"))
            .await
            .unwrap();
        let job = ledger.update_status("job-1", JobStatus::Complete).await.unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.completed_at.is_some());
        assert!(!ledger.mark_complete_if_done("job-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_status_never_moves_backward() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create("job-1", "corr", "target", 1).await.unwrap();
        ledger
            .record_result("job-1", &ItemRecord::error("job-1_000", "a.pdf", "x"))
            .await
            .unwrap();
        assert!(ledger.mark_complete_if_done("job-1").await.unwrap());

        let err = ledger
            .update_status("job-1", JobStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
        assert!(!ledger.mark_complete_if_done("job-1").await.unwrap(), "completion fires once");
        assert_eq!(ledger.get("job-1").await.unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_delete_if_unchanged_refuses_grown_entry() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create("job-1", "corr", "target", 1).await.unwrap();
        ledger
            .record_result("job-1", &ItemRecord::error("job-1_000", "a.pdf", "x"))
            .await
            .unwrap();
        ledger.mark_complete_if_done("job-1").await.unwrap();
        let snapshot = ledger.get("job-1").await.unwrap();

        ledger.increase_expected("job-1", 1).await.unwrap();
        assert!(!ledger.delete_if_unchanged(&snapshot).await.unwrap());
        assert_eq!(ledger.get("job-1").await.unwrap().expected_files, 2);

        ledger
            .record_result("job-1", &ItemRecord::error("job-1_001", "b.pdf", "x"))
            .await
            .unwrap();
        ledger.mark_complete_if_done("job-1").await.unwrap();
        let snapshot = ledger.get("job-1").await.unwrap();
        assert!(ledger.delete_if_unchanged(&snapshot).await.unwrap());
        assert!(!ledger.delete_if_unchanged(&snapshot).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, ledger) = test_ledger().await;
        ledger.create("job-1", "corr", "target", 1).await.unwrap();

        ledger.delete("job-1").await.unwrap();
        assert!(ledger.find("job-1").await.unwrap().is_none());
        assert!(matches!(ledger.delete("job-1").await, Err(Error::NotFound(_))));
    }
}
