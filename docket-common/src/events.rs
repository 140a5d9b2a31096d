//! Job lifecycle events
//!
//! Events are broadcast in-process via [`EventBus`] and serialized for SSE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::messages::Outcome;

/// Docket event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocketEvent {
    /// New job accepted and its intake message published
    JobSubmitted {
        job_id: String,
        correlation_id: String,
        item_count: usize,
        skipped_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Items appended to an existing job
    ItemsAdded {
        job_id: String,
        added: usize,
        expected: u64,
        /// True when the job was re-opened from the structured store
        resumed: bool,
        timestamp: DateTime<Utc>,
    },

    /// Fan-in recorded one item outcome
    ItemRecorded {
        job_id: String,
        item_id: String,
        outcome: Outcome,
        processed: u64,
        expected: u64,
        timestamp: DateTime<Utc>,
    },

    /// Job reached its expected count
    JobCompleted {
        job_id: String,
        success_count: u64,
        error_count: u64,
        timestamp: DateTime<Utc>,
    },

    /// Job moved into the structured store
    JobMigrated {
        job_id: String,
        migrated: u64,
        total: u64,
        timestamp: DateTime<Utc>,
    },
}

impl DocketEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            DocketEvent::JobSubmitted { .. } => "JobSubmitted",
            DocketEvent::ItemsAdded { .. } => "ItemsAdded",
            DocketEvent::ItemRecorded { .. } => "ItemRecorded",
            DocketEvent::JobCompleted { .. } => "JobCompleted",
            DocketEvent::JobMigrated { .. } => "JobMigrated",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            DocketEvent::JobSubmitted { job_id, .. }
            | DocketEvent::ItemsAdded { job_id, .. }
            | DocketEvent::ItemRecorded { job_id, .. }
            | DocketEvent::JobCompleted { job_id, .. }
            | DocketEvent::JobMigrated { job_id, .. } => job_id,
        }
    }
}

/// Broadcast bus for lifecycle events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DocketEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<DocketEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    pub fn emit(
        &self,
        event: DocketEvent,
    ) -> Result<usize, broadcast::error::SendError<DocketEvent>> {
        self.tx.send(event)
    }

    /// Emit without caring whether anyone listens
    pub fn emit_lossy(&self, event: DocketEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
