//! Stage consumers
//!
//! Each worker pulls one message at a time from its queue and hands the
//! delivery to a [`MessageHandler`]. The handler reports `Processed` or
//! `Dropped(reason)`; the loop acknowledges the message either way. A
//! malformed or unprocessable message is never redelivered, and a message is
//! only redelivered if the worker dies before reaching the ack.

pub mod extract;
pub mod score;
pub mod store;

pub use extract::ExtractHandler;
pub use score::ScoreHandler;
pub use store::StoreHandler;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{Delivery, MessageBroker};

/// What a handler did with one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Processed,
    Dropped(String),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Queue this handler consumes
    fn queue(&self) -> &'static str;

    async fn handle(&self, delivery: &Delivery) -> ConsumeOutcome;
}

/// Counters reported when a consumer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub processed: u64,
    pub dropped: u64,
}

/// Single-prefetch consumer loop for one queue
pub struct Consumer {
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn MessageHandler>,
    consumer_id: String,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        handler: Arc<dyn MessageHandler>,
        consumer_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            handler,
            consumer_id: consumer_id.into(),
            poll_interval,
        }
    }

    /// Claim and handle at most one message. `None` if the queue was empty.
    pub async fn run_once(&self) -> docket_common::Result<Option<ConsumeOutcome>> {
        let queue = self.handler.queue();
        let Some(delivery) = self.broker.claim(queue, &self.consumer_id).await? else {
            return Ok(None);
        };

        if delivery.is_redelivery() {
            info!(queue, message_id = delivery.id, deliveries = delivery.deliveries, "Redelivered message");
        }

        let outcome = self.handler.handle(&delivery).await;
        match &outcome {
            ConsumeOutcome::Processed => {}
            ConsumeOutcome::Dropped(reason) => {
                warn!(queue, message_id = delivery.id, %reason, "Message dropped");
            }
        }

        // Unconditional: a message the handler could not use will not improve on retry
        if let Err(e) = self.broker.ack(&delivery).await {
            error!(queue, message_id = delivery.id, error = %e, "Ack failed; message will be redelivered after lease expiry");
        }

        Ok(Some(outcome))
    }

    /// Consume until `cancel` fires. The message in hand is finished before returning.
    pub async fn run(self, cancel: CancellationToken) -> ConsumerStats {
        let queue = self.handler.queue();
        let mut stats = ConsumerStats::default();
        info!(queue, consumer = %self.consumer_id, "Consumer started");

        while !cancel.is_cancelled() {
            match self.run_once().await {
                Ok(Some(ConsumeOutcome::Processed)) => stats.processed += 1,
                Ok(Some(ConsumeOutcome::Dropped(_))) => stats.dropped += 1,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(queue, error = %e, "Claim failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval * 4) => {}
                    }
                }
            }
        }

        info!(
            queue,
            consumer = %self.consumer_id,
            processed = stats.processed,
            dropped = stats.dropped,
            "Consumer stopped"
        );
        stats
    }
}
