//! Storage implementations.
//!
//! Three narrow traits, one per concern:
//! - `EntityStore`: entity rows, idempotent upsert
//! - `PriceStore`: item unit prices
//! - `LossStore`: loss records and their computed values
//!
//! Backends: SQLite (feature `sqlite`) and process-local memory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::entity::{EntityData, EntityKind, EntityRecord, UpsertOutcome};
use crate::loss::{ItemPrice, LossRecord, ValueRecord};

pub mod memory;
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteEntityStore, SqliteLossStore, SqlitePriceStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt value in {table}.{column}: {reason}")]
    Corrupt {
        table: &'static str,
        column: &'static str,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage type {0} not compiled in")]
    Unsupported(String),
}

/// Entity persistence.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_by_id(&self, kind: EntityKind, id: i64) -> Result<Option<EntityRecord>>;

    async fn exists(&self, kind: EntityKind, id: i64) -> Result<bool>;

    /// Insert, or update the mutable fields of an existing row.
    ///
    /// Atomic per row: concurrent upserts of the same id never fail and
    /// never produce two rows. Founding facts are only written on create.
    async fn upsert(&self, data: &EntityData) -> Result<UpsertOutcome>;

    /// All stored ids of `kind`, ascending.
    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<i64>>;
}

/// Item unit prices.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Prices for the given type ids. Ids without a price are absent.
    async fn find_prices_by_ids(&self, type_ids: &[i64]) -> Result<HashMap<i64, f64>>;

    /// Insert or replace prices; returns how many were written.
    async fn upsert_prices(&self, prices: &[ItemPrice]) -> Result<usize>;
}

/// Loss records and their values.
#[async_trait]
pub trait LossStore: Send + Sync {
    /// Store a loss, replacing its items if it already exists.
    async fn insert_loss(&self, loss: &LossRecord) -> Result<()>;

    /// Losses with the given ids, in the order given. Unknown ids are skipped.
    async fn find_losses(&self, ids: &[i64]) -> Result<Vec<LossRecord>>;

    /// Ids of losses with no stored value, ascending.
    async fn unvalued_loss_ids(&self) -> Result<Vec<i64>>;

    /// Insert or replace values.
    async fn save_values(&self, values: &[ValueRecord]) -> Result<()>;

    async fn find_value(&self, loss_id: i64) -> Result<Option<ValueRecord>>;
}

/// The stores a process works with.
#[derive(Clone)]
pub struct Stores {
    pub entities: Arc<dyn EntityStore>,
    pub prices: Arc<dyn PriceStore>,
    pub losses: Arc<dyn LossStore>,
}

impl Stores {
    /// Fresh in-memory stores.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            entities: store.clone(),
            prices: store.clone(),
            losses: store,
        }
    }

    /// SQLite stores sharing one pool. Creates the schema.
    #[cfg(feature = "sqlite")]
    pub async fn sqlite(pool: sqlx::SqlitePool) -> Result<Self> {
        let entities = SqliteEntityStore::new(pool.clone());
        entities.init().await?;
        let prices = SqlitePriceStore::new(pool.clone());
        prices.init().await?;
        let losses = SqliteLossStore::new(pool);
        losses.init().await?;

        Ok(Self {
            entities: Arc::new(entities),
            prices: Arc::new(prices),
            losses: Arc::new(losses),
        })
    }
}

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Stores> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Storage initialized");
            Ok(Stores::memory())
        }
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&format!("sqlite:{}?mode=rwc", config.path))
                .await?;

            let stores = Stores::sqlite(pool).await?;
            info!(storage_type = "sqlite", path = %config.path, "Storage initialized");
            Ok(stores)
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err(StorageError::Unsupported("sqlite".to_string()))
        }
    }
}
