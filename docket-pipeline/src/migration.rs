//! Pending store → structured store hand-off
//!
//! There is no transaction spanning both databases. The archive write
//! commits first and the pending entry is deleted afterwards; a crash in
//! between leaves a pending copy whose items are all archived already, and
//! the next run dedups them away and finishes the delete.
//!
//! The delete is conditional on the snapshot the run started from. Items
//! added or recorded in the meantime keep the entry alive for the next run.

use chrono::Utc;
use docket_common::events::{DocketEvent, EventBus};
use docket_common::{Error, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{Archive, ArchiveCounts, Ledger};
use crate::models::{ItemRecord, JobStatus};

/// Outcome of migrating one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub job_id: String,
    /// Items written by this run
    pub migrated: u64,
    /// Items already archived by an earlier run
    pub skipped_duplicates: u64,
    pub total: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// False if the archive write committed but the pending entry was kept,
    /// either because it changed during the run or because the delete failed
    pub pending_deleted: bool,
}

#[derive(Clone)]
pub struct MigrationEngine {
    ledger: Ledger,
    archive: Archive,
    events: EventBus,
}

impl MigrationEngine {
    pub fn new(ledger: Ledger, archive: Archive, events: EventBus) -> Self {
        Self {
            ledger,
            archive,
            events,
        }
    }

    /// Move a completed job into the structured store.
    ///
    /// `InvalidTransition` if the pending entry is not `complete`. A job that
    /// is only in the structured store has nothing left to move and reports
    /// zero migrated items; `NotFound` if it is in neither store.
    pub async fn migrate(&self, job_id: &str) -> Result<MigrationReport> {
        let Some(job) = self.ledger.find(job_id).await? else {
            return self.already_archived(job_id).await;
        };
        if job.status != JobStatus::Complete {
            return Err(Error::InvalidTransition(format!(
                "job {} is {}, only complete jobs can be migrated",
                job_id, job.status
            )));
        }

        let archived_ids = self.archive.archived_item_ids(job_id).await?;
        let fresh: Vec<ItemRecord> = job
            .items()
            .filter(|item| !archived_ids.contains(&item.item_id))
            .cloned()
            .collect();
        let skipped_duplicates = (job.results.len() + job.errors.len() - fresh.len()) as u64;

        let counts = match (fresh.is_empty(), self.archive.find_job(job_id).await?) {
            (true, Some(existing)) => {
                info!(job_id, "Nothing new to migrate");
                ArchiveCounts {
                    total: existing.total,
                    success_count: existing.success_count,
                    error_count: existing.error_count,
                }
            }
            _ => self.archive.write_batch(&job, &fresh).await?,
        };

        let pending_deleted = match self.ledger.delete_if_unchanged(&job).await {
            Ok(true) => true,
            Ok(false) => {
                info!(job_id, "Pending entry changed during migration, kept for the next run");
                false
            }
            Err(e) => {
                warn!(job_id, error = %e, "Archived, but the pending entry could not be deleted");
                false
            }
        };

        info!(
            job_id,
            migrated = fresh.len(),
            skipped_duplicates,
            total = counts.total,
            "Job migrated"
        );
        self.events.emit_lossy(DocketEvent::JobMigrated {
            job_id: job_id.to_string(),
            migrated: fresh.len() as u64,
            total: counts.total,
            timestamp: Utc::now(),
        });

        Ok(MigrationReport {
            job_id: job_id.to_string(),
            migrated: fresh.len() as u64,
            skipped_duplicates,
            total: counts.total,
            success_count: counts.success_count,
            error_count: counts.error_count,
            pending_deleted,
        })
    }

    async fn already_archived(&self, job_id: &str) -> Result<MigrationReport> {
        let archived = self
            .archive
            .find_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        info!(job_id, "Job already archived");
        Ok(MigrationReport {
            job_id: job_id.to_string(),
            migrated: 0,
            skipped_duplicates: 0,
            total: archived.total,
            success_count: archived.success_count,
            error_count: archived.error_count,
            pending_deleted: true,
        })
    }

    /// Migrate every complete job. A failure on one job does not stop the rest.
    pub async fn migrate_all_complete(&self) -> Result<Vec<Result<MigrationReport>>> {
        let job_ids = self.ledger.job_ids_with_status(JobStatus::Complete).await?;
        let mut reports = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let report = self.migrate(&job_id).await;
            if let Err(e) = &report {
                warn!(%job_id, error = %e, "Migration failed");
            }
            reports.push(report);
        }
        Ok(reports)
    }
}
