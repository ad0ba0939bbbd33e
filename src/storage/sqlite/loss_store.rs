//! SQLite LossStore implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::loss::{LossItem, LossRecord, ValueRecord};
use crate::storage::schema::{LossItems, LossValues, Losses, CREATE_LOSS_TABLES};
use crate::storage::{LossStore, Result};

/// SQLite implementation of LossStore.
pub struct SqliteLossStore {
    pool: SqlitePool,
}

impl SqliteLossStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_LOSS_TABLES).execute(&self.pool).await?;
        Ok(())
    }

    async fn write_loss(conn: &mut SqliteConnection, loss: &LossRecord) -> Result<()> {
        let upsert = Query::insert()
            .into_table(Losses::Table)
            .columns([Losses::Id, Losses::ShipTypeId])
            .values_panic([loss.id.into(), loss.ship_type_id.into()])
            .on_conflict(
                OnConflict::column(Losses::Id)
                    .update_column(Losses::ShipTypeId)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&upsert).execute(&mut *conn).await?;

        let delete = Query::delete()
            .from_table(LossItems::Table)
            .and_where(Expr::col(LossItems::LossId).eq(loss.id))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&delete).execute(&mut *conn).await?;

        if loss.items.is_empty() {
            return Ok(());
        }

        let insert = {
            let mut insert = Query::insert();
            insert.into_table(LossItems::Table).columns([
                LossItems::LossId,
                LossItems::Position,
                LossItems::TypeId,
                LossItems::Destroyed,
                LossItems::Dropped,
            ]);
            for (position, item) in loss.items.iter().enumerate() {
                insert.values_panic([
                    loss.id.into(),
                    (position as i64).into(),
                    item.type_id.into(),
                    item.destroyed.into(),
                    item.dropped.into(),
                ]);
            }
            insert.to_string(SqliteQueryBuilder)
        };
        sqlx::query(&insert).execute(&mut *conn).await?;

        Ok(())
    }

    async fn write_values(conn: &mut SqliteConnection, values: &[ValueRecord]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        for value in values {
            let query = Query::insert()
                .into_table(LossValues::Table)
                .columns([
                    LossValues::LossId,
                    LossValues::TotalCents,
                    LossValues::DestroyedCents,
                    LossValues::DroppedCents,
                    LossValues::UpdatedAt,
                ])
                .values_panic([
                    value.loss_id.into(),
                    value.total_cents.into(),
                    value.destroyed_cents.into(),
                    value.dropped_cents.into(),
                    now.clone().into(),
                ])
                .on_conflict(
                    OnConflict::column(LossValues::LossId)
                        .update_columns([
                            LossValues::TotalCents,
                            LossValues::DestroyedCents,
                            LossValues::DroppedCents,
                            LossValues::UpdatedAt,
                        ])
                        .to_owned(),
                )
                .to_string(SqliteQueryBuilder);
            sqlx::query(&query).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LossStore for SqliteLossStore {
    async fn insert_loss(&self, loss: &LossRecord) -> Result<()> {
        // BEGIN IMMEDIATE takes the write lock up front, so concurrent writers
        // queue instead of failing to upgrade a shared lock. Dropping the
        // transaction uncommitted rolls it back before the connection is reused.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Self::write_loss(&mut *tx, loss).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_losses(&self, ids: &[i64]) -> Result<Vec<LossRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let losses_query = Query::select()
            .columns([Losses::Id, Losses::ShipTypeId])
            .from(Losses::Table)
            .and_where(Expr::col(Losses::Id).is_in(ids.iter().copied()))
            .to_string(SqliteQueryBuilder);
        let loss_rows = sqlx::query(&losses_query).fetch_all(&self.pool).await?;

        let items_query = Query::select()
            .columns([
                LossItems::LossId,
                LossItems::TypeId,
                LossItems::Destroyed,
                LossItems::Dropped,
            ])
            .from(LossItems::Table)
            .and_where(Expr::col(LossItems::LossId).is_in(ids.iter().copied()))
            .order_by(LossItems::LossId, Order::Asc)
            .order_by(LossItems::Position, Order::Asc)
            .to_string(SqliteQueryBuilder);
        let item_rows = sqlx::query(&items_query).fetch_all(&self.pool).await?;

        let mut items: HashMap<i64, Vec<LossItem>> = HashMap::new();
        for row in item_rows {
            items
                .entry(row.try_get("loss_id")?)
                .or_default()
                .push(LossItem {
                    type_id: row.try_get("type_id")?,
                    destroyed: row.try_get("destroyed")?,
                    dropped: row.try_get("dropped")?,
                });
        }

        let mut ships: HashMap<i64, i64> = HashMap::new();
        for row in loss_rows {
            ships.insert(row.try_get("id")?, row.try_get("ship_type_id")?);
        }

        Ok(ids
            .iter()
            .filter_map(|id| {
                ships.get(id).map(|ship_type_id| LossRecord {
                    id: *id,
                    ship_type_id: *ship_type_id,
                    // Ids may repeat; every occurrence gets the full item list.
                    items: items.get(id).cloned().unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn unvalued_loss_ids(&self) -> Result<Vec<i64>> {
        let query = Query::select()
            .column((Losses::Table, Losses::Id))
            .from(Losses::Table)
            .left_join(
                LossValues::Table,
                Expr::col((LossValues::Table, LossValues::LossId))
                    .equals((Losses::Table, Losses::Id)),
            )
            .and_where(Expr::col((LossValues::Table, LossValues::LossId)).is_null())
            .order_by((Losses::Table, Losses::Id), Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get::<i64, _>(0)?);
        }
        Ok(ids)
    }

    async fn save_values(&self, values: &[ValueRecord]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Self::write_values(&mut *tx, values).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_value(&self, loss_id: i64) -> Result<Option<ValueRecord>> {
        let query = Query::select()
            .columns([
                LossValues::LossId,
                LossValues::TotalCents,
                LossValues::DestroyedCents,
                LossValues::DroppedCents,
            ])
            .from(LossValues::Table)
            .and_where(Expr::col(LossValues::LossId).eq(loss_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|row| {
            Ok(ValueRecord {
                loss_id: row.try_get("loss_id")?,
                total_cents: row.try_get("total_cents")?,
                destroyed_cents: row.try_get("destroyed_cents")?,
                dropped_cents: row.try_get("dropped_cents")?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::test_pool;

    async fn store() -> SqliteLossStore {
        let store = SqliteLossStore::new(test_pool().await);
        store.init().await.unwrap();
        store
    }

    fn loss(id: i64) -> LossRecord {
        LossRecord {
            id,
            ship_type_id: 587,
            items: vec![LossItem::destroyed(10, 2), LossItem::dropped(11, 1)],
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_preserves_item_order() {
        let store = store().await;
        store.insert_loss(&loss(1)).await.unwrap();
        store.insert_loss(&loss(2)).await.unwrap();

        let found = store.find_losses(&[2, 99, 1]).await.unwrap();

        assert_eq!(found, vec![loss(2), loss(1)]);
    }

    #[tokio::test]
    async fn test_reinsert_replaces_items() {
        let store = store().await;
        store.insert_loss(&loss(1)).await.unwrap();

        let mut changed = loss(1);
        changed.items = vec![LossItem::destroyed(12, 5)];
        store.insert_loss(&changed).await.unwrap();

        assert_eq!(store.find_losses(&[1]).await.unwrap(), vec![changed]);
    }

    #[tokio::test]
    async fn test_writes_run_on_spawned_tasks() {
        let store = std::sync::Arc::new(store().await);

        let writer = store.clone();
        tokio::spawn(async move { writer.insert_loss(&loss(4)).await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.find_losses(&[4]).await.unwrap(), vec![loss(4)]);
    }

    #[tokio::test]
    async fn test_repeated_ids_return_full_items_each_time() {
        let store = store().await;
        store.insert_loss(&loss(5)).await.unwrap();

        let found = store.find_losses(&[5, 5]).await.unwrap();

        assert_eq!(found, vec![loss(5), loss(5)]);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_and_frees_connection() {
        let pool = test_pool().await;
        let store = SqliteLossStore::new(pool.clone());
        store.init().await.unwrap();
        sqlx::query("DROP TABLE loss_items")
            .execute(&pool)
            .await
            .unwrap();

        // The loss row is written, then the item insert fails.
        assert!(store.insert_loss(&loss(1)).await.is_err());

        // Single-connection pool: a transaction left open would make the
        // next BEGIN fail.
        store.init().await.unwrap();
        store.insert_loss(&loss(2)).await.unwrap();
        assert_eq!(store.find_losses(&[1, 2]).await.unwrap(), vec![loss(2)]);
    }

    #[tokio::test]
    async fn test_unvalued_backlog_shrinks_as_values_are_saved() {
        let store = store().await;
        for id in [3, 1, 2] {
            store.insert_loss(&loss(id)).await.unwrap();
        }
        assert_eq!(store.unvalued_loss_ids().await.unwrap(), vec![1, 2, 3]);

        let value = ValueRecord {
            loss_id: 2,
            total_cents: 23000,
            destroyed_cents: 20000,
            dropped_cents: 3000,
        };
        store.save_values(&[value]).await.unwrap();

        assert_eq!(store.unvalued_loss_ids().await.unwrap(), vec![1, 3]);
        assert_eq!(store.find_value(2).await.unwrap(), Some(value));
        assert_eq!(store.find_value(1).await.unwrap(), None);
    }
}
