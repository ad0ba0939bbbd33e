//! AMQP (RabbitMQ) queue broker.
//!
//! Work queues are published to through the default exchange (routing key =
//! queue name). Each queue is declared with `x-max-priority` and a
//! dead-letter route to `{queue}.dead-letter`, so `Nack { requeue: false }`
//! lands there without any client-side republish.
//!
//! Requeue is a republish: the payload goes back with an incremented
//! `x-attempt` header at its original priority, then the original is acked.
//! Classic priority queues do not count redeliveries, and the worker needs
//! the attempt number to bound retries.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
        QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ConnectionProperties,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::{
    BusError, Delivery, DeliveryHandler, Disposition, QueueBroker, QueueOptions, QueueStats,
    Result,
};
use crate::config::AmqpConfig;
use crate::message::dead_letter_queue;

/// Header carrying the delivery attempt across requeues.
pub const ATTEMPT_HEADER: &str = "x-attempt";

const CONTENT_TYPE: &str = "application/json";

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// RabbitMQ queue broker.
pub struct AmqpBroker {
    config: AmqpConfig,
    pool: RwLock<Pool>,
    /// Confirm-mode channel reused across publishes.
    publisher: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    /// Connect and verify the connection.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let pool = Self::build_pool(&config).await?;

        info!(url = %config.url, "Connected to AMQP");

        Ok(Self {
            config,
            pool: RwLock::new(pool),
            publisher: Mutex::new(None),
        })
    }

    async fn build_pool(config: &AmqpConfig) -> Result<Pool> {
        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        pool.get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        Ok(pool)
    }

    /// Get a fresh channel from the pool.
    async fn channel(&self) -> Result<Channel> {
        let pool = self.pool.read().await.clone();
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::ConnectionLost(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::ConnectionLost(format!("Failed to create channel: {}", e)))
    }

    /// The shared publisher channel, reopened if it was closed.
    async fn publisher_channel(&self) -> Result<Channel> {
        let mut publisher = self.publisher.lock().await;
        if let Some(channel) = publisher.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;
        *publisher = Some(channel.clone());
        Ok(channel)
    }

    fn declare_arguments(queue: &str, options: &QueueOptions) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-max-priority"),
            AMQPValue::ShortShortUInt(options.max_priority),
        );
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(dead_letter_queue(queue).into()),
        );
        args
    }
}

/// Publish `payload` to `queue` through the default exchange and wait for
/// the broker's confirm.
async fn publish_on(
    channel: &Channel,
    queue: &str,
    payload: &[u8],
    priority: u8,
    attempt: u32,
) -> Result<()> {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(ATTEMPT_HEADER),
        AMQPValue::LongUInt(attempt),
    );

    let properties = BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_delivery_mode(PERSISTENT)
        .with_priority(priority)
        .with_headers(headers);

    let mut confirmation = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions {
                mandatory: true,
                ..Default::default()
            },
            payload,
            properties,
        )
        .await
        .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
        .await
        .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

    if confirmation.is_nack() {
        return Err(BusError::Publish(format!("Broker rejected message for {}", queue)));
    }
    if confirmation.take_message().is_some() {
        // Returned as unroutable: no such queue.
        return Err(BusError::UnknownQueue(queue.to_string()));
    }
    Ok(())
}

fn attempt_of(properties: &BasicProperties) -> u32 {
    let header = properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == ATTEMPT_HEADER)
            .map(|(_, value)| value.clone())
    });
    match header {
        Some(AMQPValue::LongUInt(n)) => n.max(1),
        Some(AMQPValue::LongInt(n)) => n.max(1) as u32,
        Some(AMQPValue::LongLongInt(n)) => n.clamp(1, i64::from(u32::MAX)) as u32,
        Some(AMQPValue::ShortUInt(n)) => u32::from(n).max(1),
        _ => 1,
    }
}

fn is_not_found(error: &lapin::Error) -> bool {
    match error {
        lapin::Error::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}

/// Settle one delivery according to the handler's verdict.
async fn settle(
    channel: &Channel,
    queue: &str,
    delivery: lapin::message::Delivery,
    disposition: Disposition,
) {
    let outcome = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Nack { requeue: false } => {
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
        }
        Disposition::Nack { requeue: true } => {
            let priority = delivery.properties.priority().unwrap_or(0);
            let attempt = attempt_of(&delivery.properties) + 1;
            match publish_on(channel, queue, &delivery.data, priority, attempt).await {
                Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                Err(e) => {
                    warn!(
                        queue,
                        error = %e,
                        "Requeue republish failed, falling back to broker requeue"
                    );
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                }
            }
        }
    };

    if let Err(e) = outcome {
        error!(queue, error = %e, "Failed to settle delivery");
    }
}

#[async_trait]
impl QueueBroker for AmqpBroker {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<()> {
        let channel = self.channel().await?;
        let declare_error = |e: lapin::Error| BusError::Declare {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        channel
            .queue_declare(
                &dead_letter_queue(queue),
                QueueDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                Self::declare_arguments(queue, &options),
            )
            .await
            .map_err(declare_error)?;

        let _ = channel.close(200, "declared").await;
        debug!(queue, max_priority = options.max_priority, "Declared queue");
        Ok(())
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(queue = %queue, priority = priority))]
    async fn publish_raw(&self, queue: &str, payload: Vec<u8>, priority: u8) -> Result<()> {
        let channel = self.publisher_channel().await?;
        publish_on(&channel, queue, &payload, priority, 1).await
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        handler: Arc<dyn DeliveryHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to enable confirms: {}", e)))?;
        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let tag = format!("killfeed-{}", uuid::Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue, prefetch, "Consumer started");

        let mut in_flight = JoinSet::new();
        let outcome = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                next = consumer.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => break Err(BusError::ConnectionLost(e.to_string())),
                None => break Err(BusError::ConnectionLost("Consumer stream ended".to_string())),
            };

            let message = Delivery {
                queue: queue.to_string(),
                payload: delivery.data.clone(),
                attempt: attempt_of(&delivery.properties),
                redelivered: delivery.redelivered,
            };
            let handler = handler.clone();
            let channel = channel.clone();
            let queue_name = queue.to_string();
            let span = tracing::debug_span!("bus.consume", queue = %queue);
            in_flight.spawn(
                async move {
                    let disposition = handler.handle(message).await;
                    settle(&channel, &queue_name, delivery, disposition).await;
                }
                .instrument(span),
            );

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(queue, error = %e, "Delivery handler panicked");
                }
            }
        };

        if outcome.is_ok() {
            // Stop new deliveries before draining the ones in hand.
            if let Err(e) = channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                warn!(queue, error = %e, "Failed to cancel consumer");
            }
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(queue, error = %e, "Delivery handler panicked");
            }
        }
        if channel.status().connected() {
            let _ = channel.close(200, "consumer stopped").await;
        }
        info!(queue, "Consumer stopped");

        outcome
    }

    async fn stats(&self, queue: &str) -> Result<Option<QueueStats>> {
        // A passive declare on a missing queue closes the channel, so use a
        // throwaway one.
        let channel = self.channel().await?;
        let result = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(declared) => {
                let _ = channel.close(200, "stats").await;
                Ok(Some(QueueStats {
                    message_count: declared.message_count(),
                    consumer_count: declared.consumer_count(),
                }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(BusError::ConnectionLost(format!(
                "Failed to read stats for {}: {}",
                queue, e
            ))),
        }
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        let channel = self.channel().await?;
        let removed = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    BusError::UnknownQueue(queue.to_string())
                } else {
                    BusError::ConnectionLost(e.to_string())
                }
            })?;
        let _ = channel.close(200, "purged").await;
        info!(queue, removed, "Purged queue");
        Ok(removed)
    }

    async fn reconnect(&self) -> Result<()> {
        let pool = Self::build_pool(&self.config).await?;
        let old = std::mem::replace(&mut *self.pool.write().await, pool);
        old.close();
        *self.publisher.lock().await = None;
        info!(url = %self.config.url, "Reconnected to AMQP");
        Ok(())
    }
}
