//! Extraction stage: intake → analysis (+ error results)

use async_trait::async_trait;
use docket_common::messages::{AnalysisMessage, IntakeMessage, ResultMessage, WireMessage, INTAKE_QUEUE};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{ConsumeOutcome, MessageHandler};
use crate::broker::{publish_message, Delivery, MessageBroker};
use crate::stages::{ItemOutcome, TextExtractor};

pub struct ExtractHandler {
    broker: Arc<dyn MessageBroker>,
    extractor: Arc<dyn TextExtractor>,
}

impl ExtractHandler {
    pub fn new(broker: Arc<dyn MessageBroker>, extractor: Arc<dyn TextExtractor>) -> Self {
        Self { broker, extractor }
    }
}

#[async_trait]
impl MessageHandler for ExtractHandler {
    fn queue(&self) -> &'static str {
        INTAKE_QUEUE
    }

    async fn handle(&self, delivery: &Delivery) -> ConsumeOutcome {
        let message = match IntakeMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => return ConsumeOutcome::Dropped(e.to_string()),
        };

        let mut extracted = Vec::with_capacity(message.items.len());
        let mut failures = Vec::new();
        let mut fatal: Option<String> = None;

        for item in &message.items {
            if let Some(reason) = &fatal {
                failures.push(ResultMessage::failure(
                    &message.job_id,
                    &message.correlation_id,
                    &item.item_id,
                    &item.display_name,
                    reason.clone(),
                ));
                continue;
            }

            match self.extractor.extract(item).await {
                ItemOutcome::Ok(analysis) => extracted.push(analysis),
                ItemOutcome::ItemError(item_id, reason) => {
                    warn!(job_id = %message.job_id, %item_id, %reason, "Extraction failed");
                    failures.push(ResultMessage::failure(
                        &message.job_id,
                        &message.correlation_id,
                        item_id,
                        &item.display_name,
                        reason,
                    ));
                }
                ItemOutcome::Fatal(reason) => {
                    error!(job_id = %message.job_id, %reason, "Extraction unavailable, failing remaining items");
                    failures.push(ResultMessage::failure(
                        &message.job_id,
                        &message.correlation_id,
                        &item.item_id,
                        &item.display_name,
                        reason.clone(),
                    ));
                    fatal = Some(reason);
                }
            }
        }

        let mut lost = 0usize;
        for failure in &failures {
            if let Err(e) = publish_message(self.broker.as_ref(), failure).await {
                error!(job_id = %message.job_id, item_id = %failure.item_id, error = %e, "Failed to publish error result");
                lost += 1;
            }
        }

        let extracted_count = extracted.len();
        if !extracted.is_empty() {
            let analysis = AnalysisMessage {
                job_id: message.job_id.clone(),
                correlation_id: message.correlation_id.clone(),
                target_text: message.target_text.clone(),
                use_rate_limit: message.use_rate_limit,
                items: extracted,
            };
            if let Err(e) = publish_message(self.broker.as_ref(), &analysis).await {
                error!(job_id = %message.job_id, error = %e, "Failed to publish analysis message");
                // Items that cannot reach scoring still need a terminal outcome
                for item in &analysis.items {
                    let failure = ResultMessage::failure(
                        &message.job_id,
                        &message.correlation_id,
                        &item.item_id,
                        &item.display_name,
                        format!("could not forward to scoring: {}", e),
                    );
                    if publish_message(self.broker.as_ref(), &failure).await.is_err() {
                        lost += 1;
                    }
                }
            }
        }

        info!(
            job_id = %message.job_id,
            correlation_id = %message.correlation_id,
            extracted = extracted_count,
            failed = failures.len(),
            "Intake batch processed"
        );

        if lost > 0 {
            ConsumeOutcome::Dropped(format!("{} item(s) could not be forwarded", lost))
        } else {
            ConsumeOutcome::Processed
        }
    }
}
