//! Durable point-to-point queues
//!
//! Delivery is at-least-once with no ordering across messages. A consumer
//! claims one message at a time (prefetch = 1); the claim is a lease, so a
//! message whose consumer died before acknowledging becomes claimable again
//! once the lease expires.

use async_trait::async_trait;
use chrono::Utc;
use docket_common::messages::WireMessage;
use docket_common::retry::retry_on_lock;
use docket_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, warn};

/// A claimed, not yet acknowledged message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub queue: String,
    pub body: String,
    /// 1 on first delivery
    pub deliveries: u32,
    pub consumer: String,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.deliveries > 1
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, queue: &str, body: &str) -> Result<()>;

    /// Claim the oldest available message on `queue`, if any
    async fn claim(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>>;

    /// Remove a delivered message. Acking a message whose lease was taken over is a no-op.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Messages waiting or in flight on `queue`
    async fn depth(&self, queue: &str) -> Result<u64>;
}

/// Encode and publish a message on its own queue
pub async fn publish_message<M: WireMessage + Sync>(broker: &dyn MessageBroker, message: &M) -> Result<()> {
    let body = message.encode()?;
    broker.publish(M::QUEUE, &body).await
}

/// Broker backed by a shared SQLite database
#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
    lease: Duration,
    max_lock_wait_ms: u64,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool, lease: Duration, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            lease,
            max_lock_wait_ms,
        }
    }
}

#[async_trait]
impl MessageBroker for SqliteBroker {
    async fn publish(&self, queue: &str, body: &str) -> Result<()> {
        let pool = &self.pool;
        let enqueued_at = Utc::now().to_rfc3339();
        let enqueued_ref = enqueued_at.as_str();

        retry_on_lock("broker_publish", self.max_lock_wait_ms, || async move {
            sqlx::query("INSERT INTO queue_messages (queue, body, enqueued_at) VALUES (?, ?, ?)")
                .bind(queue)
                .bind(body)
                .bind(enqueued_ref)
                .execute(pool)
                .await?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(connection_class)?;

        debug!(queue, bytes = body.len(), "Message published");
        Ok(())
    }

    async fn claim(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>> {
        let pool = &self.pool;
        let now_ms = Utc::now().timestamp_millis();
        let lease_until = now_ms + self.lease.as_millis() as i64;

        let row = retry_on_lock("broker_claim", self.max_lock_wait_ms, || async move {
            let row = sqlx::query(
                r#"
                UPDATE queue_messages
                SET claimed_by = ?, lease_until = ?, deliveries = deliveries + 1
                WHERE id = (
                    SELECT id FROM queue_messages
                    WHERE queue = ? AND (lease_until IS NULL OR lease_until < ?)
                    ORDER BY id
                    LIMIT 1
                )
                RETURNING id, queue, body, deliveries
                "#,
            )
            .bind(consumer)
            .bind(lease_until)
            .bind(queue)
            .bind(now_ms)
            .fetch_optional(pool)
            .await?;
            Ok::<_, Error>(row)
        })
        .await
        .map_err(connection_class)?;

        Ok(row.map(|row| Delivery {
            id: row.get("id"),
            queue: row.get("queue"),
            body: row.get("body"),
            deliveries: row.get::<i64, _>("deliveries") as u32,
            consumer: consumer.to_string(),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let pool = &self.pool;
        let affected = retry_on_lock("broker_ack", self.max_lock_wait_ms, || async move {
            let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND claimed_by = ?")
                .bind(delivery.id)
                .bind(&delivery.consumer)
                .execute(pool)
                .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await
        .map_err(connection_class)?;

        if affected == 0 {
            warn!(
                queue = %delivery.queue,
                message_id = delivery.id,
                "Ack found no message; lease expired and it was claimed elsewhere"
            );
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| connection_class(Error::Database(e)))?;
        Ok(count as u64)
    }
}

/// Broker failures are reported as connection errors so callers map them to 503
fn connection_class(err: Error) -> Error {
    match err {
        Error::Database(e) => Error::Connection(format!("broker unavailable: {}", e)),
        other => other,
    }
}
