//! Loss records and their computed values.

use serde::{Deserialize, Serialize};

/// Money as integer cents.
pub type Cents = i64;

/// One fitted or carried item of a loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossItem {
    pub type_id: i64,
    pub destroyed: i64,
    pub dropped: i64,
}

impl LossItem {
    pub fn destroyed(type_id: i64, quantity: i64) -> Self {
        Self {
            type_id,
            destroyed: quantity,
            dropped: 0,
        }
    }

    pub fn dropped(type_id: i64, quantity: i64) -> Self {
        Self {
            type_id,
            destroyed: 0,
            dropped: quantity,
        }
    }
}

/// A loss event: the lost ship plus its items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossRecord {
    pub id: i64,
    /// Item type of the lost ship.
    pub ship_type_id: i64,
    pub items: Vec<LossItem>,
}

/// Computed value of a loss. `total_cents == destroyed_cents + dropped_cents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRecord {
    pub loss_id: i64,
    pub total_cents: Cents,
    pub destroyed_cents: Cents,
    pub dropped_cents: Cents,
}

impl ValueRecord {
    pub fn total(&self) -> f64 {
        self.total_cents as f64 / 100.0
    }

    pub fn destroyed(&self) -> f64 {
        self.destroyed_cents as f64 / 100.0
    }

    pub fn dropped(&self) -> f64 {
        self.dropped_cents as f64 / 100.0
    }
}

/// Unit price of an item type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemPrice {
    pub type_id: i64,
    pub price: f64,
}
