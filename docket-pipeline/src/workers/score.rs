//! Scoring stage: analysis → results

use async_trait::async_trait;
use docket_common::messages::{AnalysisMessage, ResultMessage, WireMessage, ANALYSIS_QUEUE};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{ConsumeOutcome, MessageHandler};
use crate::broker::{publish_message, Delivery, MessageBroker};
use crate::stages::{ItemOutcome, Scorer};

pub struct ScoreHandler {
    broker: Arc<dyn MessageBroker>,
    scorer: Arc<dyn Scorer>,
    /// Pause between items when the message asks for rate limiting
    rate_limit_delay: Duration,
}

impl ScoreHandler {
    pub fn new(broker: Arc<dyn MessageBroker>, scorer: Arc<dyn Scorer>, rate_limit_delay: Duration) -> Self {
        Self {
            broker,
            scorer,
            rate_limit_delay,
        }
    }
}

#[async_trait]
impl MessageHandler for ScoreHandler {
    fn queue(&self) -> &'static str {
        ANALYSIS_QUEUE
    }

    async fn handle(&self, delivery: &Delivery) -> ConsumeOutcome {
        let message = match AnalysisMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => return ConsumeOutcome::Dropped(e.to_string()),
        };

        let mut fatal: Option<String> = None;
        let mut lost = 0usize;
        let mut scored = 0usize;

        for (index, item) in message.items.iter().enumerate() {
            let result = match &fatal {
                Some(reason) => ResultMessage::failure(
                    &message.job_id,
                    &message.correlation_id,
                    &item.item_id,
                    &item.display_name,
                    reason.clone(),
                ),
                None => {
                    if message.use_rate_limit && index > 0 && !self.rate_limit_delay.is_zero() {
                        debug!(delay_ms = self.rate_limit_delay.as_millis() as u64, "Rate limit pause");
                        tokio::time::sleep(self.rate_limit_delay).await;
                    }

                    match self.scorer.score(&message.target_text, item).await {
                        ItemOutcome::Ok(card) => {
                            scored += 1;
                            ResultMessage::success(&message.job_id, &message.correlation_id, card)
                        }
                        ItemOutcome::ItemError(item_id, reason) => {
                            warn!(job_id = %message.job_id, %item_id, %reason, "Scoring failed");
                            ResultMessage::failure(
                                &message.job_id,
                                &message.correlation_id,
                                item_id,
                                &item.display_name,
                                reason,
                            )
                        }
                        ItemOutcome::Fatal(reason) => {
                            error!(job_id = %message.job_id, %reason, "Scorer unavailable, failing remaining items");
                            fatal = Some(reason.clone());
                            ResultMessage::failure(
                                &message.job_id,
                                &message.correlation_id,
                                &item.item_id,
                                &item.display_name,
                                reason,
                            )
                        }
                    }
                }
            };

            // Published per item so the fan-in sees progress as it happens
            if let Err(e) = publish_message(self.broker.as_ref(), &result).await {
                error!(job_id = %message.job_id, item_id = %result.item_id, error = %e, "Failed to publish result");
                lost += 1;
            }
        }

        info!(
            job_id = %message.job_id,
            correlation_id = %message.correlation_id,
            scored,
            failed = message.items.len() - scored,
            "Analysis batch processed"
        );

        if lost > 0 {
            ConsumeOutcome::Dropped(format!("{} result(s) could not be published", lost))
        } else {
            ConsumeOutcome::Processed
        }
    }
}
