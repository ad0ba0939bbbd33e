//! Monetary value of loss records.
//!
//! ```text
//! ship      = price(ship_type)            (capsules: CAPSULE_PRICE)
//! destroyed = ship + Σ price(item) × destroyed(item)
//! dropped   =        Σ price(item) × dropped(item)
//! total     = destroyed + dropped
//! ```
//!
//! Sums are accumulated in `f64` and rounded to cents once, at the end, so a
//! batch of records values each exactly as it would be valued alone.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Outcome, Processor};
use crate::loss::{Cents, LossRecord, ValueRecord};
use crate::message::{Queue, TypedMessage};
use crate::storage::{LossStore, PriceStore, Result};

/// Item types of capsules. Market data prices them unrealistically.
pub const CAPSULE_TYPE_IDS: [i64; 2] = [670, 33328];

/// Fixed ship value used for capsules.
pub const CAPSULE_PRICE: f64 = 10_000.0;

pub fn is_capsule(type_id: i64) -> bool {
    CAPSULE_TYPE_IDS.contains(&type_id)
}

fn to_cents(value: f64) -> Cents {
    (value * 100.0).round() as Cents
}

/// Value one loss against a price table. Missing prices count as zero.
pub fn compute_value(loss: &LossRecord, prices: &HashMap<i64, f64>) -> ValueRecord {
    let price = |type_id: i64| prices.get(&type_id).copied().unwrap_or(0.0);

    let ship = if is_capsule(loss.ship_type_id) {
        CAPSULE_PRICE
    } else {
        price(loss.ship_type_id)
    };

    let (destroyed, dropped) = loss
        .items
        .iter()
        .fold((ship, 0.0), |(destroyed, dropped), item| {
            let unit = price(item.type_id);
            (
                destroyed + unit * item.destroyed as f64,
                dropped + unit * item.dropped as f64,
            )
        });

    let destroyed_cents = to_cents(destroyed);
    let dropped_cents = to_cents(dropped);
    ValueRecord {
        loss_id: loss.id,
        total_cents: destroyed_cents + dropped_cents,
        destroyed_cents,
        dropped_cents,
    }
}

/// Every type id a set of losses needs a price for.
fn priced_type_ids(losses: &[LossRecord]) -> Vec<i64> {
    let mut ids = BTreeSet::new();
    for loss in losses {
        if !is_capsule(loss.ship_type_id) {
            ids.insert(loss.ship_type_id);
        }
        ids.extend(loss.items.iter().map(|item| item.type_id));
    }
    ids.into_iter().collect()
}

/// Values losses in batches against stored prices.
#[derive(Clone)]
pub struct ValueAggregator {
    prices: Arc<dyn PriceStore>,
    losses: Arc<dyn LossStore>,
}

impl ValueAggregator {
    pub fn new(prices: Arc<dyn PriceStore>, losses: Arc<dyn LossStore>) -> Self {
        Self { prices, losses }
    }

    /// Value `losses` with a single price lookup.
    pub async fn value_batch(&self, losses: &[LossRecord]) -> Result<Vec<ValueRecord>> {
        if losses.is_empty() {
            return Ok(Vec::new());
        }
        let prices = self
            .prices
            .find_prices_by_ids(&priced_type_ids(losses))
            .await?;
        Ok(losses
            .iter()
            .map(|loss| compute_value(loss, &prices))
            .collect())
    }

    /// Load, value and store the losses with these ids.
    ///
    /// Returns the stored values; unknown and repeated ids are skipped.
    pub async fn value_ids(&self, ids: &[i64]) -> Result<Vec<ValueRecord>> {
        let mut seen = BTreeSet::new();
        let unique: Vec<i64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let losses = self.losses.find_losses(&unique).await?;
        let values = self.value_batch(&losses).await?;
        self.losses.save_values(&values).await?;
        Ok(values)
    }

    /// Value every loss that has no value yet, `batch_size` at a time.
    pub async fn value_backlog(&self, batch_size: usize) -> Result<usize> {
        let backlog = self.losses.unvalued_loss_ids().await?;
        let mut valued = 0;
        for batch in backlog.chunks(batch_size.max(1)) {
            valued += self.value_ids(batch).await?.len();
            debug!(valued, total = backlog.len(), "Valued batch");
        }
        info!(valued, "Loss backlog valued");
        Ok(valued)
    }
}

/// Consumes the loss value queue, one loss per message.
pub struct ValueWorker {
    aggregator: ValueAggregator,
}

impl ValueWorker {
    pub fn new(aggregator: ValueAggregator) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl Processor for ValueWorker {
    fn queue(&self) -> Queue {
        Queue::LossValues
    }

    async fn process(&self, message: TypedMessage) -> Outcome {
        let loss_id = message.message().entity_id;
        match self.aggregator.value_ids(&[loss_id]).await {
            Ok(values) => match values.first() {
                Some(value) => {
                    debug!(loss_id, total = value.total(), "Loss valued");
                    Outcome::Processed
                }
                None => Outcome::NotFound,
            },
            Err(e) => Outcome::Retry(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::{ItemPrice, LossItem};
    use crate::storage::MemoryStore;

    const SHIP: i64 = 587;
    const MODULE: i64 = 2048;
    const AMMO: i64 = 215;

    fn prices() -> HashMap<i64, f64> {
        HashMap::from([(SHIP, 100.0), (MODULE, 50.0), (AMMO, 30.0)])
    }

    fn loss(id: i64) -> LossRecord {
        LossRecord {
            id,
            ship_type_id: SHIP,
            items: vec![LossItem::destroyed(MODULE, 2), LossItem::dropped(AMMO, 1)],
        }
    }

    #[test]
    fn test_destroyed_dropped_total() {
        let value = compute_value(&loss(1), &prices());

        assert_eq!(value.destroyed(), 200.00);
        assert_eq!(value.dropped(), 30.00);
        assert_eq!(value.total(), 230.00);
    }

    #[test]
    fn test_capsule_uses_fixed_price() {
        let pod = LossRecord {
            id: 1,
            ship_type_id: 670,
            items: Vec::new(),
        };
        let mut prices = prices();
        prices.insert(670, 1e12);

        assert_eq!(compute_value(&pod, &prices).destroyed(), CAPSULE_PRICE);
    }

    #[test]
    fn test_missing_prices_count_as_zero() {
        let value = compute_value(&loss(1), &HashMap::new());
        assert_eq!(value.total_cents, 0);
    }

    #[test]
    fn test_rounding_only_on_final_sums() {
        // 3 × 0.004 = 0.012 is one cent; a rounded unit price would be zero.
        let loss = LossRecord {
            id: 1,
            ship_type_id: SHIP,
            items: vec![LossItem::dropped(MODULE, 3)],
        };
        let prices = HashMap::from([(MODULE, 0.004)]);

        let value = compute_value(&loss, &prices);

        assert_eq!(value.dropped_cents, 1);
        assert_eq!(value.destroyed_cents, 0);
        assert_eq!(value.total_cents, 1);
    }

    #[tokio::test]
    async fn test_batch_equals_single() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_prices(&[
                ItemPrice {
                    type_id: SHIP,
                    price: 1234.567,
                },
                ItemPrice {
                    type_id: MODULE,
                    price: 0.019,
                },
            ])
            .await
            .unwrap();
        let aggregator = ValueAggregator::new(store.clone(), store.clone());

        let losses = vec![
            loss(1),
            LossRecord {
                id: 2,
                ship_type_id: 670,
                items: vec![LossItem::destroyed(MODULE, 7)],
            },
            LossRecord {
                id: 3,
                ship_type_id: MODULE,
                items: vec![LossItem {
                    type_id: SHIP,
                    destroyed: 3,
                    dropped: 4,
                }],
            },
        ];

        let batch = aggregator.value_batch(&losses).await.unwrap();
        for (loss, batched) in losses.iter().zip(&batch) {
            let single = aggregator
                .value_batch(std::slice::from_ref(loss))
                .await
                .unwrap();
            assert_eq!(single, vec![*batched]);
            assert_eq!(
                batched.total_cents,
                batched.destroyed_cents + batched.dropped_cents
            );
        }
    }

    #[tokio::test]
    async fn test_value_backlog_stores_every_loss() {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=5 {
            store.insert_loss(&loss(id)).await.unwrap();
        }
        let aggregator = ValueAggregator::new(store.clone(), store.clone());

        let valued = aggregator.value_backlog(2).await.unwrap();

        assert_eq!(valued, 5);
        assert!(store.unvalued_loss_ids().await.unwrap().is_empty());
        assert!(store.find_value(3).await.unwrap().is_some());
    }

    async fn repeated_ids_are_valued_once(stores: crate::storage::Stores) {
        stores
            .prices
            .upsert_prices(&[
                ItemPrice {
                    type_id: SHIP,
                    price: 100.0,
                },
                ItemPrice {
                    type_id: MODULE,
                    price: 50.0,
                },
            ])
            .await
            .unwrap();
        let five = LossRecord {
            id: 5,
            ship_type_id: SHIP,
            items: vec![LossItem::destroyed(MODULE, 2)],
        };
        stores.losses.insert_loss(&five).await.unwrap();
        assert_eq!(
            stores.losses.find_losses(&[5, 5]).await.unwrap(),
            vec![five.clone(), five]
        );
        let aggregator = ValueAggregator::new(stores.prices.clone(), stores.losses.clone());

        let values = aggregator.value_ids(&[5, 5]).await.unwrap();

        assert_eq!(values.len(), 1);
        assert_eq!(values[0].destroyed_cents, 20000);
        let stored = stores.losses.find_value(5).await.unwrap().unwrap();
        assert_eq!(stored.destroyed_cents, 20000);
    }

    #[tokio::test]
    async fn test_repeated_ids_valued_once_in_memory() {
        repeated_ids_are_valued_once(crate::storage::Stores::memory()).await;
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_repeated_ids_valued_once_in_sqlite() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let stores = crate::storage::Stores::sqlite(pool).await.unwrap();
        repeated_ids_are_valued_once(stores).await;
    }

    #[tokio::test]
    async fn test_worker_unknown_loss_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let worker = ValueWorker::new(ValueAggregator::new(store.clone(), store));
        let message = TypedMessage::LossValue(crate::message::QueueMessage::new(9, "test"));

        assert_eq!(worker.process(message).await, Outcome::NotFound);
    }
}
