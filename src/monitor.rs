//! Operator view of the queues.

use serde::Serialize;
use tracing::warn;

use crate::bus::{QueueBroker, Result};
use crate::message::{dead_letter_queue, Queue};

/// Depth and consumers of one work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub queue: String,
    /// `false` until some process declares the queue.
    pub exists: bool,
    pub messages: u32,
    pub consumers: u32,
    pub dead_letters: u32,
}

/// Snapshot of every work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub queues: Vec<QueueHealth>,
    /// True when at least one queue has an active consumer.
    pub healthy: bool,
}

/// Read stats for every queue of the pipeline.
///
/// Queues that do not exist yet are reported, not treated as errors:
/// monitoring routinely races queue creation.
pub async fn health_report(broker: &dyn QueueBroker) -> Result<HealthReport> {
    let mut queues = Vec::with_capacity(Queue::ALL.len());

    for queue in Queue::ALL {
        let stats = broker.stats(queue.name()).await?;
        let dead_letters = match broker.stats(&dead_letter_queue(queue.name())).await {
            Ok(stats) => stats.map(|s| s.message_count).unwrap_or_default(),
            Err(e) => {
                warn!(queue = %queue, error = %e, "Failed to read dead-letter stats");
                0
            }
        };

        queues.push(QueueHealth {
            queue: queue.name().to_string(),
            exists: stats.is_some(),
            messages: stats.map(|s| s.message_count).unwrap_or_default(),
            consumers: stats.map(|s| s.consumer_count).unwrap_or_default(),
            dead_letters,
        });
    }

    let healthy = queues.iter().any(|q| q.consumers > 0);
    Ok(HealthReport { queues, healthy })
}
