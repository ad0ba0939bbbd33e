//! SQLite PriceStore implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::loss::ItemPrice;
use crate::storage::schema::{ItemPrices, CREATE_ITEM_PRICES_TABLE};
use crate::storage::{PriceStore, Result};

/// Rows per multi-value insert.
const INSERT_CHUNK: usize = 500;

/// SQLite implementation of PriceStore.
pub struct SqlitePriceStore {
    pool: SqlitePool,
}

impl SqlitePriceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_ITEM_PRICES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PriceStore for SqlitePriceStore {
    async fn find_prices_by_ids(&self, type_ids: &[i64]) -> Result<HashMap<i64, f64>> {
        if type_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let query = Query::select()
            .columns([ItemPrices::TypeId, ItemPrices::Price])
            .from(ItemPrices::Table)
            .and_where(Expr::col(ItemPrices::TypeId).is_in(type_ids.iter().copied()))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut prices = HashMap::with_capacity(rows.len());
        for row in rows {
            prices.insert(row.try_get("type_id")?, row.try_get("price")?);
        }
        Ok(prices)
    }

    async fn upsert_prices(&self, prices: &[ItemPrice]) -> Result<usize> {
        let now = Utc::now().to_rfc3339();

        for chunk in prices.chunks(INSERT_CHUNK) {
            let query = {
                let mut insert = Query::insert();
                insert
                    .into_table(ItemPrices::Table)
                    .columns([ItemPrices::TypeId, ItemPrices::Price, ItemPrices::UpdatedAt]);
                for price in chunk {
                    insert.values_panic([
                        price.type_id.into(),
                        price.price.into(),
                        now.clone().into(),
                    ]);
                }
                insert
                    .on_conflict(
                        OnConflict::column(ItemPrices::TypeId)
                            .update_columns([ItemPrices::Price, ItemPrices::UpdatedAt])
                            .to_owned(),
                    )
                    .to_string(SqliteQueryBuilder)
            };

            sqlx::query(&query).execute(&self.pool).await?;
        }

        Ok(prices.len())
    }
}
