//! SQLite implementations of storage interfaces.

use chrono::{DateTime, Utc};

use super::{Result, StorageError};

mod entity_store;
mod loss_store;
mod price_store;

pub use entity_store::SqliteEntityStore;
pub use loss_store::SqliteLossStore;
pub use price_store::SqlitePriceStore;

/// Timestamps are stored as RFC3339 TEXT.
fn parse_timestamp(
    table: &'static str,
    column: &'static str,
    value: &str,
) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt {
            table,
            column,
            reason: e.to_string(),
        })
}

#[cfg(test)]
async fn test_pool() -> sqlx::SqlitePool {
    // Single connection: every connection to :memory: is its own database.
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}
