//! In-process queue broker.
//!
//! Priority queues held in process memory, shared by every consumer in the
//! process. Mirrors the broker semantics the workers rely on: priority then
//! insertion order, prefetch-bounded concurrent delivery, requeue at the
//! head, dead-lettering, passive stats. Contents vanish on exit, so it only
//! suits tests and single-process runs.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{
    BusError, Delivery, DeliveryHandler, Disposition, QueueBroker, QueueOptions, QueueStats,
    Result,
};
use crate::message::dead_letter_queue;

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: u8,
    seq: u64,
    payload: Vec<u8>,
    attempt: u32,
}

// Max-heap: highest priority first, then lowest sequence number.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    options: QueueOptions,
    ready: BinaryHeap<Entry>,
    consumers: u32,
}

#[derive(Debug)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    /// Woken on every publish, requeue and sever.
    notify: Notify,
    seq: AtomicU64,
    connected: AtomicBool,
}

impl Inner {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::ConnectionLost("memory broker severed".to_string()))
        }
    }

    async fn pop(&self, queue: &str) -> Result<Option<Entry>> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
        Ok(state.ready.pop())
    }

    async fn settle(&self, queue: &str, entry: Entry, disposition: Disposition) {
        let mut queues = self.queues.lock().await;
        match disposition {
            Disposition::Ack => {}
            Disposition::Nack { requeue: true } => {
                // Keeps its sequence number, so it goes back to the head.
                if let Some(state) = queues.get_mut(queue) {
                    state.ready.push(Entry {
                        attempt: entry.attempt + 1,
                        ..entry
                    });
                }
            }
            Disposition::Nack { requeue: false } => {
                let seq = self.next_seq();
                queues
                    .entry(dead_letter_queue(queue))
                    .or_default()
                    .ready
                    .push(Entry { seq, ..entry });
                debug!(queue, "Delivery dead-lettered");
            }
        }
        drop(queues);
        self.notify.notify_waiters();
    }
}

/// Process-local priority queue broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                seq: AtomicU64::new(0),
                connected: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate a dropped connection: running consumers return
    /// `ConnectionLost` and every call fails until [`QueueBroker::reconnect`].
    /// Queue contents survive, like durable queues on a real broker.
    pub fn sever(&self) {
        self.inner.connected.store(false, AtomicOrdering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Ready payloads of `queue` in delivery order.
    pub async fn snapshot(&self, queue: &str) -> Vec<Vec<u8>> {
        let queues = self.inner.queues.lock().await;
        let Some(state) = queues.get(queue) else {
            return Vec::new();
        };
        let mut entries: Vec<&Entry> = state.ready.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.payload.clone()).collect()
    }

    /// Wait for the next ready entry; `None` once `cancel` fires.
    async fn next_entry(&self, queue: &str, cancel: &CancellationToken) -> Result<Option<Entry>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.inner.ensure_connected()?;
            if let Some(entry) = self.inner.pop(queue).await? {
                return Ok(Some(entry));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    async fn adjust_consumers(&self, queue: &str, register: bool) {
        let mut queues = self.inner.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.consumers = if register {
                state.consumers + 1
            } else {
                state.consumers.saturating_sub(1)
            };
        }
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<()> {
        self.inner.ensure_connected()?;
        let mut queues = self.inner.queues.lock().await;
        queues.entry(queue.to_string()).or_insert_with(|| QueueState {
            options,
            ..Default::default()
        });
        queues.entry(dead_letter_queue(queue)).or_default();
        Ok(())
    }

    async fn publish_raw(&self, queue: &str, payload: Vec<u8>, priority: u8) -> Result<()> {
        self.inner.ensure_connected()?;
        let seq = self.inner.next_seq();
        {
            let mut queues = self.inner.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
            state.ready.push(Entry {
                priority: priority.min(state.options.max_priority),
                seq,
                payload,
                attempt: 1,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
        handler: Arc<dyn DeliveryHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.inner.ensure_connected()?;
        if self.stats(queue).await?.is_none() {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }
        self.adjust_consumers(queue, true).await;
        info!(queue, prefetch, "Consumer started");

        let permits = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
        let mut in_flight = JoinSet::new();

        let outcome = loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let entry = match self.next_entry(queue, &cancel).await {
                Ok(Some(entry)) => entry,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let delivery = Delivery {
                queue: queue.to_string(),
                payload: entry.payload.clone(),
                attempt: entry.attempt,
                redelivered: entry.attempt > 1,
            };
            let handler = handler.clone();
            let inner = self.inner.clone();
            let queue_name = queue.to_string();
            in_flight.spawn(async move {
                let disposition = handler.handle(delivery).await;
                inner.settle(&queue_name, entry, disposition).await;
                drop(permit);
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(queue, error = %e, "Delivery handler panicked");
                }
            }
        };

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(queue, error = %e, "Delivery handler panicked");
            }
        }
        self.adjust_consumers(queue, false).await;
        info!(queue, "Consumer stopped");

        outcome
    }

    async fn stats(&self, queue: &str) -> Result<Option<QueueStats>> {
        self.inner.ensure_connected()?;
        let queues = self.inner.queues.lock().await;
        Ok(queues.get(queue).map(|state| QueueStats {
            message_count: state.ready.len() as u32,
            consumer_count: state.consumers,
        }))
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        self.inner.ensure_connected()?;
        let mut queues = self.inner.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
        let removed = state.ready.len() as u32;
        state.ready.clear();
        Ok(removed)
    }

    async fn reconnect(&self) -> Result<()> {
        self.inner.connected.store(true, AtomicOrdering::SeqCst);
        info!("Memory broker reconnected");
        Ok(())
    }
}
