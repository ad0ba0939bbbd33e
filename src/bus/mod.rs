//! Durable work queues.
//!
//! This module contains:
//! - `QueueBroker` trait: declare, publish, consume-with-prefetch, stats, purge
//! - `DeliveryHandler` trait: what a consumer runs per delivery
//! - Implementations: in-process (`MemoryBroker`) and AMQP (`AmqpBroker`)
//!
//! Every declared queue is durable, priority-capable (0-10) and paired with a
//! `{queue}.dead-letter` companion that receives deliveries settled with
//! `Nack { requeue: false }`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MessagingConfig, MessagingType};
use crate::message::{QueueMessage, MAX_PRIORITY, PRIORITY_DEFAULT};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The broker connection dropped while consuming or publishing.
    /// Callers reconnect and re-declare.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Declare failed for {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Queue {0} has not been declared")]
    UnknownQueue(String),

    #[error("Messaging type {0} not compiled in")]
    Unsupported(String),
}

/// Options a queue is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub max_priority: u8,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            max_priority: MAX_PRIORITY,
        }
    }
}

/// Depth and consumer count of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages ready for delivery (excludes unacknowledged deliveries).
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One delivery handed to a [`DeliveryHandler`].
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the delivery was consumed from.
    pub queue: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery; incremented every time the message is requeued.
    pub attempt: u32,
    pub redelivered: bool,
}

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// `requeue: false` dead-letters the message.
    Nack { requeue: bool },
}

impl Disposition {
    pub const REQUEUE: Disposition = Disposition::Nack { requeue: true };
    pub const DEAD_LETTER: Disposition = Disposition::Nack { requeue: false };
}

/// Handler for deliveries consumed from a queue.
///
/// Called concurrently, up to the consumer's prefetch.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Disposition;
}

/// Interface to a durable priority queue broker.
///
/// Implementations:
/// - `MemoryBroker`: process-local, for tests and single-process runs
/// - `AmqpBroker`: RabbitMQ via AMQP (feature `amqp`)
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Declare `queue` and its dead-letter companion. Idempotent.
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<()>;

    /// Publish a raw payload; returns once the broker confirmed receipt.
    async fn publish_raw(&self, queue: &str, payload: Vec<u8>, priority: u8) -> Result<()>;

    /// Consume `queue` until `cancel` fires or the connection drops.
    ///
    /// At most `prefetch` deliveries are in flight at once. In-flight
    /// handlers always finish and are settled before this returns.
    /// Returns `Ok(())` on cancellation, `BusError::ConnectionLost` when the
    /// connection dropped.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        handler: Arc<dyn DeliveryHandler>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Depth and consumers of `queue`; `None` if it does not exist yet.
    async fn stats(&self, queue: &str) -> Result<Option<QueueStats>>;

    /// Drop all ready messages; returns how many were removed.
    async fn purge(&self, queue: &str) -> Result<u32>;

    /// Rebuild the connection. Queues must be re-declared afterwards.
    async fn reconnect(&self) -> Result<()>;

    /// Publish a queue message at its own priority (default 5).
    async fn publish(&self, queue: &str, message: &QueueMessage) -> Result<()> {
        let priority = message.priority.unwrap_or(PRIORITY_DEFAULT);
        self.publish_raw(queue, message.to_bytes(), priority).await
    }

    /// Publish messages one by one.
    ///
    /// Not atomic: a failure part way leaves the earlier messages published.
    /// Workers are idempotent, so the caller can republish the whole batch.
    async fn publish_batch(&self, queue: &str, messages: &[QueueMessage]) -> Result<usize> {
        for (published, message) in messages.iter().enumerate() {
            if let Err(e) = self.publish(queue, message).await {
                warn!(
                    queue,
                    published,
                    total = messages.len(),
                    error = %e,
                    "Batch publish interrupted"
                );
                return Err(e);
            }
        }
        debug!(queue, count = messages.len(), "Published batch");
        Ok(messages.len())
    }
}

/// Construct the broker named by the messaging configuration.
pub async fn init_broker(config: &MessagingConfig) -> Result<Arc<dyn QueueBroker>> {
    match config.messaging_type {
        MessagingType::Memory => {
            info!(messaging_type = "memory", "Queue broker initialized");
            Ok(Arc::new(MemoryBroker::new()))
        }
        #[cfg(feature = "amqp")]
        MessagingType::Amqp => {
            let broker = AmqpBroker::connect(config.amqp.clone()).await?;
            info!(messaging_type = "amqp", "Queue broker initialized");
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "amqp"))]
        MessagingType::Amqp => Err(BusError::Unsupported("amqp".to_string())),
    }
}
