//! PostgreSQL-backed broker
//!
//! Messages live in `broker_messages`. Competing consumers claim rows with
//! `FOR UPDATE SKIP LOCKED`, so a message is handed to exactly one consumer
//! per visibility window.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{dead_letter_queue, BrokerError, BrokerSettings, Delivery, MessageBroker};

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    queue: String,
    payload: serde_json::Value,
    delivery_count: i32,
}

impl From<MessageRow> for Delivery {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            queue: row.queue,
            payload: row.payload,
            delivery_count: row.delivery_count,
        }
    }
}

#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
    settings: BrokerSettings,
}

impl PgBroker {
    pub fn new(pool: PgPool, settings: BrokerSettings) -> Self {
        Self { pool, settings }
    }

    /// Claim one visible message, dead-lettering any that ran out of deliveries
    async fn claim(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let row = sqlx::query_as::<_, MessageRow>(
                r#"
                UPDATE broker_messages
                SET visible_at = NOW() + make_interval(secs => $2),
                    delivery_count = delivery_count + 1
                WHERE id = (
                    SELECT id
                    FROM broker_messages
                    WHERE queue = $1 AND visible_at <= NOW()
                    ORDER BY id
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, queue, payload, delivery_count
                "#,
            )
            .bind(queue)
            .bind(self.settings.visibility_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            if row.delivery_count > self.settings.max_deliveries {
                let dead = dead_letter_queue(queue);
                warn!(
                    queue = %queue,
                    message_id = row.id,
                    deliveries = row.delivery_count - 1,
                    dead_letter_queue = %dead,
                    "Message exceeded max deliveries, moving to dead-letter queue"
                );
                sqlx::query(
                    r#"
                    UPDATE broker_messages
                    SET queue = $2, visible_at = NOW(), delivery_count = 0
                    WHERE id = $1
                    "#,
                )
                .bind(row.id)
                .bind(&dead)
                .execute(&self.pool)
                .await?;
                continue;
            }

            return Ok(Some(row.into()));
        }
    }

    /// Number of messages currently stored for `queue`, visible or not
    pub async fn depth(&self, queue: &str) -> Result<i64, BrokerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broker_messages WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl MessageBroker for PgBroker {
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<(), BrokerError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO broker_messages (queue, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(queue)
        .bind(Json(payload))
        .fetch_one(&self.pool)
        .await?;

        debug!(queue = %queue, message_id = id, "Published message");
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(delivery) = self.claim(queue).await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> Result<bool, BrokerError> {
        // delivery_count pins the claim; a redelivered row has a higher count
        let result = sqlx::query(
            r#"
            UPDATE broker_messages
            SET visible_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND queue = $2 AND delivery_count = $4
            "#,
        )
        .bind(delivery.id)
        .bind(&delivery.queue)
        .bind(visibility.as_secs_f64())
        .bind(delivery.delivery_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        sqlx::query("DELETE FROM broker_messages WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        sqlx::query("UPDATE broker_messages SET visible_at = NOW() WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
