//! Durable work queues
//!
//! The manager and the workers never talk to each other directly; every
//! message goes through a [`MessageBroker`]. Delivery is at-least-once:
//!
//! - [`MessageBroker::receive`] claims one message and hides it for the
//!   visibility timeout.
//! - [`MessageBroker::extend`] pushes the timeout back while the consumer
//!   is still working on it.
//! - [`MessageBroker::ack`] removes it for good.
//! - Anything not acknowledged becomes visible again, either right away
//!   ([`MessageBroker::nack`]) or once the visibility timeout expires.
//! - After `max_deliveries` claims a message moves to `<queue>.dead` and is
//!   no longer handed out.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use memory::InMemoryBroker;
pub use postgres::PgBroker;

use crate::config::BrokerConfig;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Suffix appended to a queue name to form its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dead";

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// A claimed message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Number of times this message has been claimed, including this one
    pub delivery_count: i32,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Timing and redelivery settings shared by broker implementations
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    pub visibility_timeout: Duration,
    pub max_deliveries: i32,
    pub poll_interval: Duration,
}

impl From<&BrokerConfig> for BrokerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout(),
            max_deliveries: config.max_deliveries,
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_deliveries: 5,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Names of the three queues the pipeline uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub job_requests: String,
    pub worker_requests: String,
    pub worker_replies: String,
}

impl From<&BrokerConfig> for QueueNames {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            job_requests: config.job_requests_queue.clone(),
            worker_requests: config.worker_requests_queue.clone(),
            worker_replies: config.worker_replies_queue.clone(),
        }
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            job_requests: crate::config::DEFAULT_JOB_REQUESTS_QUEUE.to_string(),
            worker_requests: crate::config::DEFAULT_WORKER_REQUESTS_QUEUE.to_string(),
            worker_replies: crate::config::DEFAULT_WORKER_REPLIES_QUEUE.to_string(),
        }
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, queue: &str, payload: serde_json::Value) -> Result<(), BrokerError>;

    /// Claim the oldest visible message, waiting up to `wait` for one to appear
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Keep `delivery` hidden for another `visibility` from now.
    ///
    /// Returns `false` once the claim is lost, i.e. the message was acked,
    /// nacked, or handed to another consumer after its timeout expired.
    async fn extend(&self, delivery: &Delivery, visibility: Duration) -> Result<bool, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Make the message visible again immediately
    async fn nack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Cheap liveness check used by the health endpoint
    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Serialize `message` and publish it on `queue`
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn MessageBroker,
    queue: &str,
    message: &T,
) -> Result<(), BrokerError> {
    let payload = serde_json::to_value(message)?;
    broker.publish(queue, payload).await
}
