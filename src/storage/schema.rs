//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Entities table schema. One row per (kind, id).
#[derive(Iden)]
pub enum Entities {
    Table,
    #[iden = "kind"]
    Kind,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "ticker"]
    Ticker,
    #[iden = "parent_id"]
    ParentId,
    #[iden = "member_count"]
    MemberCount,
    #[iden = "founded_at"]
    FoundedAt,
    #[iden = "creator_id"]
    CreatorId,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Item prices table schema.
#[derive(Iden)]
pub enum ItemPrices {
    Table,
    #[iden = "type_id"]
    TypeId,
    #[iden = "price"]
    Price,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Losses table schema.
#[derive(Iden)]
pub enum Losses {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "ship_type_id"]
    ShipTypeId,
}

/// Loss items table schema.
#[derive(Iden)]
pub enum LossItems {
    Table,
    #[iden = "loss_id"]
    LossId,
    #[iden = "position"]
    Position,
    #[iden = "type_id"]
    TypeId,
    #[iden = "destroyed"]
    Destroyed,
    #[iden = "dropped"]
    Dropped,
}

/// Loss values table schema.
#[derive(Iden)]
pub enum LossValues {
    Table,
    #[iden = "loss_id"]
    LossId,
    #[iden = "total_cents"]
    TotalCents,
    #[iden = "destroyed_cents"]
    DestroyedCents,
    #[iden = "dropped_cents"]
    DroppedCents,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// SQL for creating the entities table.
pub const CREATE_ENTITIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    kind TEXT NOT NULL,
    id INTEGER NOT NULL,
    name TEXT NOT NULL,
    ticker TEXT,
    parent_id INTEGER,
    member_count INTEGER,
    founded_at TEXT,
    creator_id INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);

CREATE INDEX IF NOT EXISTS idx_entities_parent ON entities(kind, parent_id);
"#;

/// SQL for creating the item prices table.
pub const CREATE_ITEM_PRICES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS item_prices (
    type_id INTEGER PRIMARY KEY,
    price REAL NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQL for creating the loss tables.
pub const CREATE_LOSS_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS losses (
    id INTEGER PRIMARY KEY,
    ship_type_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS loss_items (
    loss_id INTEGER NOT NULL REFERENCES losses(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    type_id INTEGER NOT NULL,
    destroyed INTEGER NOT NULL DEFAULT 0,
    dropped INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (loss_id, position)
);

CREATE TABLE IF NOT EXISTS loss_values (
    loss_id INTEGER PRIMARY KEY REFERENCES losses(id) ON DELETE CASCADE,
    total_cents INTEGER NOT NULL,
    destroyed_cents INTEGER NOT NULL,
    dropped_cents INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;
