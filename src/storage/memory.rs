//! In-memory implementation of all storage traits.
//!
//! Used by tests and the standalone profile. Contents vanish on exit.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::entity::{EntityData, EntityKind, EntityRecord, UpsertOutcome};
use crate::loss::{ItemPrice, LossRecord, ValueRecord};
use crate::storage::{EntityStore, LossStore, PriceStore, Result, StorageError};

/// Process-local store for entities, prices and losses.
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<(EntityKind, i64), EntityRecord>>,
    prices: RwLock<HashMap<i64, f64>>,
    losses: RwLock<BTreeMap<i64, LossRecord>>,
    values: RwLock<HashMap<i64, ValueRecord>>,
    fail_writes: RwLock<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset.
    pub async fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.write().await = fail;
    }

    async fn check_writable(&self) -> Result<()> {
        if *self.fail_writes.read().await {
            return Err(StorageError::Io(std::io::Error::other(
                "writes disabled on memory store",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_by_id(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRecord>> {
        Ok(self.entities.read().await.get(&(kind, id)).cloned())
    }

    async fn exists(&self, kind: EntityKind, id: i64) -> Result<bool> {
        Ok(self.entities.read().await.contains_key(&(kind, id)))
    }

    async fn upsert(&self, data: &EntityData) -> Result<UpsertOutcome> {
        self.check_writable().await?;
        let now = Utc::now();
        let mut entities = self.entities.write().await;

        match entities.get_mut(&(data.kind, data.id)) {
            Some(record) => {
                record.data.name = data.name.clone();
                record.data.ticker = data.ticker.clone();
                record.data.parent_id = data.parent_id;
                record.data.member_count = data.member_count;
                record.updated_at = now;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                entities.insert(
                    (data.kind, data.id),
                    EntityRecord {
                        data: data.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .entities
            .read()
            .await
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn find_prices_by_ids(&self, type_ids: &[i64]) -> Result<HashMap<i64, f64>> {
        let prices = self.prices.read().await;
        Ok(type_ids
            .iter()
            .filter_map(|id| prices.get(id).map(|price| (*id, *price)))
            .collect())
    }

    async fn upsert_prices(&self, prices: &[ItemPrice]) -> Result<usize> {
        self.check_writable().await?;
        let mut stored = self.prices.write().await;
        for price in prices {
            stored.insert(price.type_id, price.price);
        }
        Ok(prices.len())
    }
}

#[async_trait]
impl LossStore for MemoryStore {
    async fn insert_loss(&self, loss: &LossRecord) -> Result<()> {
        self.check_writable().await?;
        self.losses.write().await.insert(loss.id, loss.clone());
        Ok(())
    }

    async fn find_losses(&self, ids: &[i64]) -> Result<Vec<LossRecord>> {
        let losses = self.losses.read().await;
        Ok(ids.iter().filter_map(|id| losses.get(id).cloned()).collect())
    }

    async fn unvalued_loss_ids(&self) -> Result<Vec<i64>> {
        let losses = self.losses.read().await;
        let values = self.values.read().await;
        Ok(losses
            .keys()
            .filter(|id| !values.contains_key(id))
            .copied()
            .collect())
    }

    async fn save_values(&self, values: &[ValueRecord]) -> Result<()> {
        self.check_writable().await?;
        let mut stored = self.values.write().await;
        for value in values {
            stored.insert(value.loss_id, *value);
        }
        Ok(())
    }

    async fn find_value(&self, loss_id: i64) -> Result<Option<ValueRecord>> {
        Ok(self.values.read().await.get(&loss_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::LossItem;

    #[tokio::test]
    async fn test_upsert_keeps_founding_facts() {
        let store = MemoryStore::new();
        let mut data = EntityData::new(EntityKind::Suborganization, 5, "Corp");
        data.creator_id = Some(1);

        assert_eq!(store.upsert(&data).await.unwrap(), UpsertOutcome::Created);

        data.name = "Renamed".to_string();
        data.creator_id = Some(2);
        data.member_count = Some(40);
        assert_eq!(store.upsert(&data).await.unwrap(), UpsertOutcome::Updated);

        let record = store
            .find_by_id(EntityKind::Suborganization, 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.data.name, "Renamed");
        assert_eq!(record.data.member_count, Some(40));
        assert_eq!(record.data.creator_id, Some(1));
        assert!(record.updated_at >= record.created_at);
    }

    #[tokio::test]
    async fn test_list_ids_filters_kind_and_sorts() {
        let store = MemoryStore::new();
        for id in [3, 1, 2] {
            store
                .upsert(&EntityData::new(EntityKind::Organization, id, "o"))
                .await
                .unwrap();
        }
        store
            .upsert(&EntityData::new(EntityKind::Individual, 9, "i"))
            .await
            .unwrap();

        assert_eq!(
            store.list_ids(EntityKind::Organization).await.unwrap(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_unvalued_backlog() {
        let store = MemoryStore::new();
        for id in [2, 1] {
            store
                .insert_loss(&LossRecord {
                    id,
                    ship_type_id: 1,
                    items: vec![LossItem::destroyed(2, 1)],
                })
                .await
                .unwrap();
        }
        store
            .save_values(&[ValueRecord {
                loss_id: 1,
                total_cents: 1,
                destroyed_cents: 1,
                dropped_cents: 0,
            }])
            .await
            .unwrap();

        assert_eq!(store.unvalued_loss_ids().await.unwrap(), vec![2]);
        assert_eq!(store.find_losses(&[2, 7, 1]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true).await;

        let result = store
            .upsert(&EntityData::new(EntityKind::ItemType, 1, "x"))
            .await;

        assert!(matches!(result, Err(StorageError::Io(_))));
        assert!(!store.exists(EntityKind::ItemType, 1).await.unwrap());
    }
}
