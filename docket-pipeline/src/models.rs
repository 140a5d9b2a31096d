//! Job and item models
//!
//! Job lifecycle: `pending → complete → archived`. The single backward move is
//! the re-open path, taken when items are added to a completed or archived job.

use chrono::{DateTime, Utc};
use docket_common::messages::{Outcome, ResultMessage, ScoreCard};
use docket_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Items outstanding
    Pending,
    /// Every expected item has a terminal outcome
    Complete,
    /// Moved into the structured store
    Archived,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Complete => "complete",
            JobStatus::Archived => "archived",
        }
    }

    /// Whether an explicit status edit may move `self → next`.
    ///
    /// Re-asserting the current status is allowed. `complete → archived`
    /// belongs to migration and the moves back to `pending` belong to the
    /// re-open path, so neither is an edit.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Pending) | (Complete, Complete) | (Archived, Archived) | (Pending, Complete)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "complete" => Ok(JobStatus::Complete),
            "archived" => Ok(JobStatus::Archived),
            other => Err(Error::InvalidInput(format!("unknown job status '{}'", other))),
        }
    }
}

/// Terminal outcome of one item as held by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: String,
    pub display_name: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ScoreCard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ItemRecord {
    pub fn from_result(message: &ResultMessage) -> Self {
        Self {
            item_id: message.item_id.clone(),
            display_name: message.display_name.clone(),
            outcome: message.outcome,
            payload: message.payload.clone(),
            error: message.error.clone(),
            recorded_at: Utc::now(),
        }
    }

    pub fn error(item_id: impl Into<String>, display_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            display_name: display_name.into(),
            outcome: Outcome::Error,
            payload: None,
            error: Some(reason.into()),
            recorded_at: Utc::now(),
        }
    }

    pub fn match_score(&self) -> Option<u8> {
        self.payload.as_ref().map(|card| card.match_score)
    }
}

/// Fan-in counters after a ledger write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub success: u64,
    pub error: u64,
    pub expected: u64,
}

impl ItemCounts {
    pub fn processed(&self) -> u64 {
        self.success + self.error
    }

    pub fn is_done(&self) -> bool {
        self.processed() == self.expected
    }
}

/// What `record_result` did with an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Item appended
    Applied(ItemCounts),
    /// Item id already recorded; nothing changed
    Duplicate(ItemCounts),
    /// Job already holds `expected` outcomes; nothing changed
    Overflow(ItemCounts),
}

impl RecordOutcome {
    pub fn counts(&self) -> ItemCounts {
        match self {
            RecordOutcome::Applied(c) | RecordOutcome::Duplicate(c) | RecordOutcome::Overflow(c) => *c,
        }
    }
}

/// Snapshot of a pending store entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingJob {
    pub job_id: String,
    pub correlation_id: String,
    pub target_text: String,
    pub status: JobStatus,
    pub expected_files: u64,
    /// First item index of this entry; non-zero for a job re-opened from the archive
    pub item_offset: u64,
    pub results: Vec<ItemRecord>,
    pub errors: Vec<ItemRecord>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PendingJob {
    pub fn counts(&self) -> ItemCounts {
        ItemCounts {
            success: self.results.len() as u64,
            error: self.errors.len() as u64,
            expected: self.expected_files,
        }
    }

    /// Index the next added item will get
    pub fn next_item_index(&self) -> u64 {
        self.item_offset + self.expected_files
    }

    pub fn items(&self) -> impl Iterator<Item = &ItemRecord> {
        self.results.iter().chain(self.errors.iter())
    }
}

/// Archived job row with its aggregate counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedJob {
    pub job_id: String,
    pub correlation_id: String,
    pub target_text: String,
    pub status: JobStatus,
    pub total: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: DateTime<Utc>,
}

/// Archived job with items ordered by match score, best first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedJobView {
    #[serde(flatten)]
    pub job: ArchivedJob,
    pub items: Vec<ItemRecord>,
}

/// Where a job currently lives
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "store", rename_all = "lowercase")]
pub enum JobView {
    Pending(PendingJob),
    Archived(ArchivedJob),
}
