//! Queue workers.
//!
//! A worker is a [`Processor`] (what to do with one message) driven by a
//! [`WorkerRuntime`] (how messages arrive and are settled):
//!
//! ```text
//! broker.consume --> Dispatch::handle --> TypedMessage::decode --> Processor::process
//!                         |                      |                        |
//!                         |               malformed: dead-letter     Outcome
//!                         +<----------- Disposition <--- attempts / counters
//! ```
//!
//! Processors never see raw payloads or broker dispositions; they report an
//! [`Outcome`] and the runtime decides between ack, requeue and dead-letter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backon::Retryable;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{BusError, Delivery, DeliveryHandler, Disposition, QueueBroker, QueueOptions};
use crate::config::WorkerConfig;
use crate::entity::{Individuals, ItemTypes, Organizations, Suborganizations};
use crate::message::{Queue, TypedMessage};
use crate::storage::Stores;
use crate::upstream::{RateLimitedClient, UpstreamError};
use crate::utils::retry::reconnect_backoff;

pub mod discovery;
pub mod entity;
pub mod value;

pub use discovery::DiscoveryWorker;
pub use entity::EntityWorker;
pub use value::{ValueAggregator, ValueWorker};

/// Result of processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    /// Already stored; no upstream call was made.
    Skipped,
    /// The upstream does not know the id. Permanent.
    NotFound,
    /// Transient failure; the message should be tried again.
    Retry(String),
    /// Permanent failure; the message goes to the dead-letter queue.
    Reject(String),
}

impl Outcome {
    /// Metric and log label.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Processed => "processed",
            Outcome::Skipped => "skipped",
            Outcome::NotFound => "not_found",
            Outcome::Retry(_) => "retry",
            Outcome::Reject(_) => "reject",
        }
    }
}

impl From<UpstreamError> for Outcome {
    fn from(error: UpstreamError) -> Self {
        match error {
            UpstreamError::NotFound { .. } => Outcome::NotFound,
            e @ (UpstreamError::Transient(_) | UpstreamError::Closed) => {
                Outcome::Retry(e.to_string())
            }
            e @ (UpstreamError::Decode { .. } | UpstreamError::Rejected { .. }) => {
                Outcome::Reject(e.to_string())
            }
        }
    }
}

/// Per-message logic of a worker kind.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Queue this processor consumes.
    fn queue(&self) -> Queue;

    /// Queues this processor publishes to. Declared alongside [`Self::queue`].
    fn publishes_to(&self) -> Vec<Queue> {
        Vec::new()
    }

    async fn process(&self, message: TypedMessage) -> Outcome;
}

/// Worker kinds a process can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum WorkerKind {
    Organization,
    Suborganization,
    Individual,
    ItemType,
    Discovery,
    Value,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 6] = [
        WorkerKind::Organization,
        WorkerKind::Suborganization,
        WorkerKind::Individual,
        WorkerKind::ItemType,
        WorkerKind::Discovery,
        WorkerKind::Value,
    ];

    /// Kinds to start: every kind when `all` is set, otherwise `requested`
    /// with duplicates removed. One runtime per queue.
    pub fn selection(requested: &[WorkerKind], all: bool) -> Vec<WorkerKind> {
        if all {
            return Self::ALL.to_vec();
        }
        let mut kinds = requested.to_vec();
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }

    /// Build the processor for this kind.
    pub fn processor(
        &self,
        client: &RateLimitedClient,
        broker: &Arc<dyn QueueBroker>,
        stores: &Stores,
    ) -> Arc<dyn Processor> {
        let client = client.clone();
        match self {
            WorkerKind::Organization => Arc::new(EntityWorker::<Organizations>::new(
                client,
                stores.entities.clone(),
            )),
            WorkerKind::Suborganization => Arc::new(EntityWorker::<Suborganizations>::new(
                client,
                stores.entities.clone(),
            )),
            WorkerKind::Individual => Arc::new(EntityWorker::<Individuals>::new(
                client,
                stores.entities.clone(),
            )),
            WorkerKind::ItemType => Arc::new(EntityWorker::<ItemTypes>::new(
                client,
                stores.entities.clone(),
            )),
            WorkerKind::Discovery => Arc::new(DiscoveryWorker::new(client, broker.clone())),
            WorkerKind::Value => Arc::new(ValueWorker::new(ValueAggregator::new(
                stores.prices.clone(),
                stores.losses.clone(),
            ))),
        }
    }
}

/// Counters kept by a running worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub skipped: u64,
    pub not_found: u64,
    /// Transient failures that were requeued.
    pub failed: u64,
    pub dead_lettered: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Delivery handler that decodes, processes and settles.
struct Dispatch {
    queue: Queue,
    processor: Arc<dyn Processor>,
    max_attempts: Option<u32>,
    stats: Arc<WorkerStats>,
}

impl Dispatch {
    fn settle(&self, outcome: Outcome, attempt: u32) -> Disposition {
        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{outcome_attr, queue_attr, WORKER_OUTCOME_TOTAL};
            WORKER_OUTCOME_TOTAL.add(
                1,
                &[queue_attr(self.queue.name()), outcome_attr(outcome.label())],
            );
        }

        match outcome {
            Outcome::Processed => {
                WorkerStats::bump(&self.stats.processed);
                Disposition::Ack
            }
            Outcome::Skipped => {
                WorkerStats::bump(&self.stats.skipped);
                debug!("Already stored, skipped");
                Disposition::Ack
            }
            Outcome::NotFound => {
                WorkerStats::bump(&self.stats.not_found);
                debug!("Not found upstream, discarded");
                Disposition::Ack
            }
            Outcome::Retry(reason) => match self.max_attempts {
                Some(max) if attempt >= max => {
                    WorkerStats::bump(&self.stats.dead_lettered);
                    error!(%reason, attempt, max_attempts = max, "Attempts exhausted, dead-lettering");
                    Disposition::DEAD_LETTER
                }
                _ => {
                    WorkerStats::bump(&self.stats.failed);
                    warn!(%reason, attempt, "Transient failure, requeueing");
                    Disposition::REQUEUE
                }
            },
            Outcome::Reject(reason) => {
                WorkerStats::bump(&self.stats.dead_lettered);
                error!(%reason, "Permanent failure, dead-lettering");
                Disposition::DEAD_LETTER
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for Dispatch {
    async fn handle(&self, delivery: Delivery) -> Disposition {
        let message = match TypedMessage::decode(self.queue, &delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                WorkerStats::bump(&self.stats.dead_lettered);
                #[cfg(feature = "otel")]
                {
                    use crate::utils::metrics::{outcome_attr, queue_attr, WORKER_OUTCOME_TOTAL};
                    WORKER_OUTCOME_TOTAL
                        .add(1, &[queue_attr(self.queue.name()), outcome_attr("malformed")]);
                }
                warn!(queue = %self.queue, error = %e, "Malformed message, dead-lettering");
                return Disposition::DEAD_LETTER;
            }
        };

        let span = info_span!(
            "worker.process",
            queue = %self.queue,
            entity_id = message.message().entity_id,
            attempt = delivery.attempt,
        );
        let outcome = self.processor.process(message).instrument(span.clone()).await;
        span.in_scope(|| self.settle(outcome, delivery.attempt))
    }
}

/// Runs one processor against the broker until cancelled.
pub struct WorkerRuntime {
    broker: Arc<dyn QueueBroker>,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
}

impl WorkerRuntime {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        processor: Arc<dyn Processor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            processor,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn queue(&self) -> Queue {
        self.processor.queue()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The delivery handler this runtime consumes with.
    pub fn handler(&self) -> Arc<dyn DeliveryHandler> {
        Arc::new(Dispatch {
            queue: self.processor.queue(),
            processor: self.processor.clone(),
            max_attempts: self.config.max_attempts,
            stats: self.stats.clone(),
        })
    }

    /// Declare every queue this worker touches.
    async fn declare(&self) -> crate::bus::Result<()> {
        let mut queues = vec![self.processor.queue()];
        queues.extend(self.processor.publishes_to());
        for queue in queues {
            self.broker
                .declare(queue.name(), QueueOptions::default())
                .await?;
        }
        Ok(())
    }

    /// Consume until `cancel` fires.
    ///
    /// A lost connection triggers reconnect and re-declare with backoff;
    /// any other broker error ends the run.
    pub async fn run(&self, cancel: CancellationToken) -> crate::bus::Result<()> {
        let queue = self.processor.queue();
        self.declare().await?;
        info!(
            queue = %queue,
            prefetch = self.config.prefetch,
            max_attempts = ?self.config.max_attempts,
            "Worker started"
        );

        let result = loop {
            let consumed = self
                .broker
                .consume(
                    queue.name(),
                    self.config.prefetch,
                    self.handler(),
                    cancel.clone(),
                )
                .await;

            match consumed {
                Ok(()) => break Ok(()),
                Err(BusError::ConnectionLost(reason)) => {
                    warn!(queue = %queue, %reason, "Broker connection lost, reconnecting");
                    match self.reconnect(&cancel).await {
                        Some(Ok(())) => info!(queue = %queue, "Reconnected"),
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let stats = self.stats();
        info!(
            queue = %queue,
            processed = stats.processed,
            skipped = stats.skipped,
            not_found = stats.not_found,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            "Worker stopped"
        );
        result
    }

    /// Reconnect and re-declare; `None` if cancelled first.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<crate::bus::Result<()>> {
        let cycle = || async {
            self.broker.reconnect().await?;
            self.declare().await
        };
        let retried = cycle
            .retry(reconnect_backoff())
            .notify(|e: &BusError, delay| {
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconnect attempt failed"
                );
            });

        tokio::select! {
            _ = cancel.cancelled() => None,
            result = retried => Some(result),
        }
    }
}
