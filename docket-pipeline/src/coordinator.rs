//! Pipeline coordinator
//!
//! Owns the job state machine: submission with compensation, incremental
//! additions (including the re-open path for archived jobs) and the fan-in
//! step that records result messages and detects completion.
//!
//! Every step that can fail after another step has already changed state
//! undoes that earlier change before returning the error, so a failed
//! submission leaves nothing behind in the ledger, the staging area or the
//! broker.

use chrono::Utc;
use docket_common::events::{DocketEvent, EventBus};
use docket_common::messages::{IntakeItem, IntakeMessage, ResultMessage};
use docket_common::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{publish_message, MessageBroker};
use crate::db::{Archive, Ledger};
use crate::models::{ItemCounts, ItemRecord, JobView, RecordOutcome};
use crate::staging::{item_id, validate_job_id, SkippedFile, StagedItem, StagingArea, Upload};

/// Response to a new submission
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReport {
    pub job_id: String,
    pub correlation_id: String,
    pub status: String,
    pub file_count: usize,
    pub items: Vec<StagedItem>,
    pub skipped_files: Vec<SkippedFile>,
    pub skipped_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response to an incremental addition
#[derive(Debug, Clone, Serialize)]
pub struct AddItemsReport {
    pub job_id: String,
    pub correlation_id: String,
    pub added: usize,
    pub expected_files: u64,
    /// True when the job came back from the structured store
    pub resumed: bool,
    pub items: Vec<StagedItem>,
    pub skipped_files: Vec<SkippedFile>,
}

/// Attempts at `add_items` when the pending entry appears or disappears
/// between the existence check and the write
const ADD_ATTEMPTS: usize = 3;

/// Outcome of one attempt at adding items
enum AddAttempt {
    Done(AddItemsReport),
    /// The pending entry changed under us before anything was written
    Retry(Vec<Upload>, Vec<SkippedFile>),
}

/// What the fan-in did with one result message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub outcome: RecordOutcome,
    /// This call performed the `pending → complete` transition
    pub completed: bool,
}

#[derive(Clone)]
pub struct Coordinator {
    ledger: Ledger,
    archive: Archive,
    broker: Arc<dyn MessageBroker>,
    staging: StagingArea,
    events: EventBus,
}

impl Coordinator {
    pub fn new(
        ledger: Ledger,
        archive: Archive,
        broker: Arc<dyn MessageBroker>,
        staging: StagingArea,
        events: EventBus,
    ) -> Self {
        Self {
            ledger,
            archive,
            broker,
            staging,
            events,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Accept a new job.
    ///
    /// Order: validate, stage, create the ledger entry, publish intake. A
    /// ledger failure removes the staged files; a publish failure also
    /// deletes the ledger entry.
    pub async fn submit(
        &self,
        target_text: &str,
        use_rate_limit: bool,
        uploads: Vec<Upload>,
    ) -> Result<SubmitReport> {
        self.staging.validate_target_text(target_text)?;
        let (accepted, skipped) = self.staging.partition(uploads);
        if accepted.is_empty() {
            return Err(no_valid_files(&skipped));
        }

        let job_id = Uuid::new_v4().to_string();
        let correlation_id = Uuid::new_v4().to_string();

        let staged = match self.staging.stage(&job_id, 0, accepted).await {
            Ok(staged) => staged,
            Err(e) => {
                self.discard_job_dir(&job_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .ledger
            .create(&job_id, &correlation_id, target_text, staged.len() as u64)
            .await
        {
            error!(%job_id, error = %e, "Ledger create failed, removing staged files");
            self.discard_job_dir(&job_id).await;
            return Err(e);
        }

        let intake = intake_message(&job_id, &correlation_id, target_text, use_rate_limit, &staged);
        if let Err(e) = publish_message(self.broker.as_ref(), &intake).await {
            error!(%job_id, error = %e, "Intake publish failed, rolling back submission");
            if let Err(delete_err) = self.ledger.delete(&job_id).await {
                error!(%job_id, error = %delete_err, "Rollback could not delete ledger entry");
            }
            self.discard_job_dir(&job_id).await;
            return Err(e);
        }

        info!(
            %job_id,
            %correlation_id,
            items = staged.len(),
            skipped = skipped.len(),
            "Job submitted"
        );
        self.events.emit_lossy(DocketEvent::JobSubmitted {
            job_id: job_id.clone(),
            correlation_id: correlation_id.clone(),
            item_count: staged.len(),
            skipped_count: skipped.len(),
            timestamp: Utc::now(),
        });

        let message = (!skipped.is_empty()).then(|| {
            format!(
                "{} file(s) accepted, {} skipped",
                staged.len(),
                skipped.len()
            )
        });

        Ok(SubmitReport {
            job_id,
            correlation_id,
            status: "accepted".to_string(),
            file_count: staged.len(),
            skipped_count: skipped.len(),
            items: staged,
            skipped_files: skipped,
            message,
        })
    }

    /// Add items to an existing job.
    ///
    /// A job still in the pending store has its expected count raised. A job
    /// only present in the structured store is re-opened: a fresh pending
    /// entry expects just the new items and numbers them after the archived ones.
    pub async fn add_items(
        &self,
        job_id: &str,
        use_rate_limit: bool,
        uploads: Vec<Upload>,
    ) -> Result<AddItemsReport> {
        validate_job_id(job_id)?;
        let (accepted, skipped) = self.staging.partition(uploads);
        if accepted.is_empty() {
            return Err(no_valid_files(&skipped));
        }

        // A migration may delete the entry, or a concurrent add may re-open
        // it, between the check and the write
        let mut batch = (accepted, skipped);
        let mut report = None;
        for _ in 0..ADD_ATTEMPTS {
            let (accepted, skipped) = batch;
            let attempt = if self.ledger.exists(job_id).await? {
                self.add_to_pending(job_id, use_rate_limit, accepted, skipped).await?
            } else {
                self.reopen_archived(job_id, use_rate_limit, accepted, skipped).await?
            };
            match attempt {
                AddAttempt::Done(done) => {
                    report = Some(done);
                    break;
                }
                AddAttempt::Retry(accepted, skipped) => {
                    debug!(job_id, "Pending entry changed concurrently, retrying add");
                    batch = (accepted, skipped);
                }
            }
        }
        let report = report.ok_or_else(|| {
            Error::InvalidTransition(format!("job {} kept changing while items were added", job_id))
        })?;

        self.events.emit_lossy(DocketEvent::ItemsAdded {
            job_id: job_id.to_string(),
            added: report.added,
            expected: report.expected_files,
            resumed: report.resumed,
            timestamp: Utc::now(),
        });
        Ok(report)
    }

    async fn add_to_pending(
        &self,
        job_id: &str,
        use_rate_limit: bool,
        accepted: Vec<Upload>,
        skipped: Vec<SkippedFile>,
    ) -> Result<AddAttempt> {
        let count = accepted.len() as u64;
        let names: Vec<String> = accepted.iter().map(|u| u.filename.clone()).collect();
        let slot = match self.ledger.increase_expected(job_id, count).await {
            Ok(slot) => slot,
            Err(Error::NotFound(_)) => return Ok(AddAttempt::Retry(accepted, skipped)),
            Err(e) => return Err(e),
        };
        let job = self.ledger.get(job_id).await?;

        // From here on the expected count covers these items, so each failure
        // path must still give every reserved item a terminal outcome.
        let staged = match self.staging.stage(job_id, slot.first_index, accepted).await {
            Ok(staged) => staged,
            Err(e) => {
                let reserved = names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| {
                        (item_id(job_id, slot.first_index + i as u64), name.clone())
                    })
                    .collect::<Vec<_>>();
                self.fail_reserved(job_id, &reserved, &format!("staging failed: {}", e)).await;
                return Err(e);
            }
        };

        let intake = intake_message(job_id, &job.correlation_id, &job.target_text, use_rate_limit, &staged);
        if let Err(e) = publish_message(self.broker.as_ref(), &intake).await {
            error!(job_id, error = %e, "Intake publish failed for added items");
            let reserved = staged
                .iter()
                .map(|s| (s.item_id.clone(), s.display_name.clone()))
                .collect::<Vec<_>>();
            self.staging.remove_files(&staged_paths(&staged)).await;
            self.fail_reserved(job_id, &reserved, "publish failed").await;
            return Err(e);
        }

        info!(job_id, added = staged.len(), expected = slot.expected_files, "Items added to pending job");
        Ok(AddAttempt::Done(AddItemsReport {
            job_id: job_id.to_string(),
            correlation_id: job.correlation_id,
            added: staged.len(),
            expected_files: slot.expected_files,
            resumed: false,
            items: staged,
            skipped_files: skipped,
        }))
    }

    async fn reopen_archived(
        &self,
        job_id: &str,
        use_rate_limit: bool,
        accepted: Vec<Upload>,
        skipped: Vec<SkippedFile>,
    ) -> Result<AddAttempt> {
        let archived = self
            .archive
            .find_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        let offset = self
            .archive
            .next_item_index(job_id)
            .await?
            .unwrap_or(archived.total);
        let count = accepted.len() as u64;

        match self
            .ledger
            .create_resumed(job_id, &archived.correlation_id, &archived.target_text, count, offset)
            .await
        {
            Ok(_) => {}
            Err(Error::AlreadyExists(_)) => {
                debug!(job_id, "Job re-opened concurrently, joining pending entry");
                return Ok(AddAttempt::Retry(accepted, skipped));
            }
            Err(e) => return Err(e),
        }

        let staged = match self.staging.stage(job_id, offset, accepted).await {
            Ok(staged) => staged,
            Err(e) => {
                self.rollback_reopen(job_id).await;
                return Err(e);
            }
        };

        let intake = intake_message(
            job_id,
            &archived.correlation_id,
            &archived.target_text,
            use_rate_limit,
            &staged,
        );
        if let Err(e) = publish_message(self.broker.as_ref(), &intake).await {
            error!(job_id, error = %e, "Intake publish failed for re-opened job, rolling back");
            self.staging.remove_files(&staged_paths(&staged)).await;
            self.rollback_reopen(job_id).await;
            return Err(e);
        }

        info!(
            job_id,
            added = staged.len(),
            item_offset = offset,
            archived_total = archived.total,
            "Archived job re-opened"
        );
        Ok(AddAttempt::Done(AddItemsReport {
            job_id: job_id.to_string(),
            correlation_id: archived.correlation_id,
            added: staged.len(),
            expected_files: count,
            resumed: true,
            items: staged,
            skipped_files: skipped,
        }))
    }

    /// Fan-in: record one result and complete the job if it was the last one.
    ///
    /// Safe under redelivery: a duplicate item id or an item arriving after
    /// the job is full changes nothing. The completion check runs on every
    /// call so a crash between the two steps is repaired by the redelivery.
    pub async fn apply_result(&self, message: &ResultMessage) -> Result<ApplyReport> {
        let record = ItemRecord::from_result(message);
        let outcome = self.ledger.record_result(&message.job_id, &record).await?;

        match outcome {
            RecordOutcome::Applied(counts) => {
                self.events.emit_lossy(DocketEvent::ItemRecorded {
                    job_id: message.job_id.clone(),
                    item_id: message.item_id.clone(),
                    outcome: message.outcome,
                    processed: counts.processed(),
                    expected: counts.expected,
                    timestamp: Utc::now(),
                });
            }
            RecordOutcome::Duplicate(_) => {
                debug!(job_id = %message.job_id, item_id = %message.item_id, "Duplicate result");
            }
            RecordOutcome::Overflow(counts) => {
                warn!(
                    job_id = %message.job_id,
                    item_id = %message.item_id,
                    expected = counts.expected,
                    "Result for a job that already holds every expected outcome"
                );
            }
        }

        let completed = self.ledger.mark_complete_if_done(&message.job_id).await?;
        if completed {
            self.on_completed(&message.job_id, outcome.counts()).await;
        }

        Ok(ApplyReport { outcome, completed })
    }

    /// Pending snapshot if the job is in flight, otherwise its archived record
    pub async fn job_view(&self, job_id: &str) -> Result<JobView> {
        if let Some(job) = self.ledger.find(job_id).await? {
            return Ok(JobView::Pending(job));
        }
        match self.archive.find_job(job_id).await? {
            Some(job) => Ok(JobView::Archived(job)),
            None => Err(Error::NotFound(format!("job {}", job_id))),
        }
    }

    async fn on_completed(&self, job_id: &str, counts: ItemCounts) {
        info!(job_id, success = counts.success, errors = counts.error, "Job completed");
        if let Err(e) = self.staging.remove_job(job_id).await {
            warn!(job_id, error = %e, "Failed to clean up staging directory");
        }
        self.events.emit_lossy(DocketEvent::JobCompleted {
            job_id: job_id.to_string(),
            success_count: counts.success,
            error_count: counts.error,
            timestamp: Utc::now(),
        });
    }

    /// Give reserved items a terminal error so the job can still complete
    async fn fail_reserved(&self, job_id: &str, items: &[(String, String)], reason: &str) {
        let mut last = None;
        for (item_id, display_name) in items {
            let record = ItemRecord::error(item_id, display_name, reason);
            match self.ledger.record_result(job_id, &record).await {
                Ok(outcome) => last = Some(outcome.counts()),
                Err(e) => error!(job_id, %item_id, error = %e, "Failed to record error outcome"),
            }
        }

        match self.ledger.mark_complete_if_done(job_id).await {
            Ok(true) => {
                if let Some(counts) = last {
                    self.on_completed(job_id, counts).await;
                }
            }
            Ok(false) => {}
            Err(e) => warn!(job_id, error = %e, "Completion check failed after compensation"),
        }
    }

    async fn rollback_reopen(&self, job_id: &str) {
        if let Err(e) = self.ledger.delete(job_id).await {
            error!(job_id, error = %e, "Rollback could not delete re-opened ledger entry");
        }
    }

    async fn discard_job_dir(&self, job_id: &str) {
        if let Err(e) = self.staging.remove_job(job_id).await {
            warn!(job_id, error = %e, "Failed to remove staging directory");
        }
    }
}

fn intake_message(
    job_id: &str,
    correlation_id: &str,
    target_text: &str,
    use_rate_limit: bool,
    staged: &[StagedItem],
) -> IntakeMessage {
    IntakeMessage {
        job_id: job_id.to_string(),
        correlation_id: correlation_id.to_string(),
        target_text: target_text.to_string(),
        use_rate_limit,
        items: staged
            .iter()
            .map(|s| IntakeItem {
                item_id: s.item_id.clone(),
                path: s.path.display().to_string(),
                display_name: s.display_name.clone(),
            })
            .collect(),
    }
}

fn staged_paths(staged: &[StagedItem]) -> Vec<PathBuf> {
    staged.iter().map(|s| s.path.clone()).collect()
}

fn no_valid_files(skipped: &[SkippedFile]) -> Error {
    let details = skipped
        .iter()
        .map(|s| format!("{}: {}", s.filename, s.reason))
        .collect::<Vec<_>>()
        .join("; ");
    if details.is_empty() {
        Error::InvalidInput("no files provided".into())
    } else {
        Error::InvalidInput(format!("no valid files ({})", details))
    }
}
