//! SQLite EntityStore implementation.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::parse_timestamp;
use crate::entity::{EntityData, EntityKind, EntityRecord, UpsertOutcome};
use crate::storage::schema::{Entities, CREATE_ENTITIES_TABLE};
use crate::storage::{EntityStore, Result, StorageError};

const TABLE: &str = "entities";

/// SQLite implementation of EntityStore.
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    /// Create a new SQLite entity store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_ENTITIES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn record_from_row(kind: EntityKind, row: &SqliteRow) -> Result<EntityRecord> {
        let founded_at: Option<String> = row.try_get("founded_at")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(EntityRecord {
            data: EntityData {
                kind,
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                ticker: row.try_get("ticker")?,
                parent_id: row.try_get("parent_id")?,
                member_count: row.try_get("member_count")?,
                founded_at: founded_at
                    .map(|t| parse_timestamp(TABLE, "founded_at", &t))
                    .transpose()?,
                creator_id: row.try_get("creator_id")?,
            },
            created_at: parse_timestamp(TABLE, "created_at", &created_at)?,
            updated_at: parse_timestamp(TABLE, "updated_at", &updated_at)?,
        })
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn find_by_id(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRecord>> {
        let query = Query::select()
            .columns([
                Entities::Id,
                Entities::Name,
                Entities::Ticker,
                Entities::ParentId,
                Entities::MemberCount,
                Entities::FoundedAt,
                Entities::CreatorId,
                Entities::CreatedAt,
                Entities::UpdatedAt,
            ])
            .from(Entities::Table)
            .and_where(Expr::col(Entities::Kind).eq(kind.as_str()))
            .and_where(Expr::col(Entities::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|row| Self::record_from_row(kind, &row)).transpose()
    }

    async fn exists(&self, kind: EntityKind, id: i64) -> Result<bool> {
        let query = Query::select()
            .expr(Expr::val(1))
            .from(Entities::Table)
            .and_where(Expr::col(Entities::Kind).eq(kind.as_str()))
            .and_where(Expr::col(Entities::Id).eq(id))
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    async fn upsert(&self, data: &EntityData) -> Result<UpsertOutcome> {
        let now = Utc::now().to_rfc3339();

        // One statement: SQLite serializes writers, so two workers upserting
        // the same id end with one row and the later values.
        let query = Query::insert()
            .into_table(Entities::Table)
            .columns([
                Entities::Kind,
                Entities::Id,
                Entities::Name,
                Entities::Ticker,
                Entities::ParentId,
                Entities::MemberCount,
                Entities::FoundedAt,
                Entities::CreatorId,
                Entities::CreatedAt,
                Entities::UpdatedAt,
            ])
            .values_panic([
                data.kind.as_str().into(),
                data.id.into(),
                data.name.clone().into(),
                data.ticker.clone().into(),
                data.parent_id.into(),
                data.member_count.into(),
                data.founded_at.map(|t| t.to_rfc3339()).into(),
                data.creator_id.into(),
                now.clone().into(),
                now.clone().into(),
            ])
            .on_conflict(
                OnConflict::columns([Entities::Kind, Entities::Id])
                    .update_columns([
                        Entities::Name,
                        Entities::Ticker,
                        Entities::ParentId,
                        Entities::MemberCount,
                        Entities::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .returning_col(Entities::CreatedAt)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let created_at: String = row.try_get("created_at")?;

        Ok(if created_at == now {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<i64>> {
        let query = Query::select()
            .column(Entities::Id)
            .from(Entities::Table)
            .and_where(Expr::col(Entities::Kind).eq(kind.as_str()))
            .order_by(Entities::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(StorageError::from))
            .collect()
    }
}
