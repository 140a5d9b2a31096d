//! Fan-in stage: results → ledger

use async_trait::async_trait;
use docket_common::messages::{ResultMessage, WireMessage, RESULTS_QUEUE};
use docket_common::Error;
use tracing::debug;

use super::{ConsumeOutcome, MessageHandler};
use crate::broker::Delivery;
use crate::coordinator::Coordinator;
use crate::models::RecordOutcome;

pub struct StoreHandler {
    coordinator: Coordinator,
}

impl StoreHandler {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl MessageHandler for StoreHandler {
    fn queue(&self) -> &'static str {
        RESULTS_QUEUE
    }

    async fn handle(&self, delivery: &Delivery) -> ConsumeOutcome {
        let message = match ResultMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => return ConsumeOutcome::Dropped(e.to_string()),
        };

        match self.coordinator.apply_result(&message).await {
            Ok(report) => match report.outcome {
                RecordOutcome::Overflow(counts) => ConsumeOutcome::Dropped(format!(
                    "job {} already holds {} of {} outcomes",
                    message.job_id,
                    counts.processed(),
                    counts.expected
                )),
                _ => {
                    debug!(job_id = %message.job_id, item_id = %message.item_id, completed = report.completed, "Result stored");
                    ConsumeOutcome::Processed
                }
            },
            Err(Error::NotFound(_)) => {
                ConsumeOutcome::Dropped(format!("no pending job {} for item {}", message.job_id, message.item_id))
            }
            Err(e) => ConsumeOutcome::Dropped(format!("failed to record {}: {}", message.item_id, e)),
        }
    }
}
