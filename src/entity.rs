//! Entities ingested from the upstream API.
//!
//! Four kinds share one record shape ([`EntityRecord`]). Each kind has an
//! [`EntityDefinition`] naming its upstream endpoint, payload type and
//! queue, so one generic worker serves all of them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::message::Queue;

/// Upstream listing of every organization id.
pub const ORGANIZATION_LIST_PATH: &str = "/alliances/";

/// Upstream listing of market prices for every item type.
pub const MARKET_PRICES_PATH: &str = "/markets/prices/";

/// Upstream listing of an organization's suborganization ids.
pub fn suborganizations_path(organization_id: i64) -> String {
    format!("/alliances/{}/corporations/", organization_id)
}

/// Kind of an ingested entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Organization,
    Suborganization,
    Individual,
    ItemType,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Organization,
        EntityKind::Suborganization,
        EntityKind::Individual,
        EntityKind::ItemType,
    ];

    /// Storage discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::Suborganization => "suborganization",
            EntityKind::Individual => "individual",
            EntityKind::ItemType => "item_type",
        }
    }

    /// Queue carrying fetch requests for this kind.
    pub fn queue(&self) -> Queue {
        match self {
            EntityKind::Organization => Queue::Organizations,
            EntityKind::Suborganization => Queue::Suborganizations,
            EntityKind::Individual => Queue::Individuals,
            EntityKind::ItemType => Queue::ItemTypes,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown entity kind: {}", s))
    }
}

/// Fields an upsert writes.
///
/// `name`, `ticker`, `parent_id` and `member_count` are refreshed on every
/// upsert; `founded_at` and `creator_id` are founding facts, written when
/// the row is created and never touched afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityData {
    pub kind: EntityKind,
    pub id: i64,
    pub name: String,
    pub ticker: Option<String>,
    pub parent_id: Option<i64>,
    pub member_count: Option<i64>,
    pub founded_at: Option<DateTime<Utc>>,
    pub creator_id: Option<i64>,
}

impl EntityData {
    pub fn new(kind: EntityKind, id: i64, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
            ticker: None,
            parent_id: None,
            member_count: None,
            founded_at: None,
            creator_id: None,
        }
    }
}

/// A stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub data: EntityData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether an upsert created the row or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Per-kind binding between the upstream API and storage.
pub trait EntityDefinition: Send + Sync + 'static {
    /// Upstream response body for a single entity.
    type Payload: DeserializeOwned + Send;

    const KIND: EntityKind;

    /// Upstream path of the entity with this id.
    fn path(id: i64) -> String;

    fn into_data(id: i64, payload: Self::Payload) -> EntityData;
}

/// Top-level organizations (alliances upstream).
pub struct Organizations;

#[derive(Debug, Deserialize)]
pub struct OrganizationPayload {
    pub name: String,
    pub ticker: String,
    pub creator_id: Option<i64>,
    pub executor_corporation_id: Option<i64>,
    pub date_founded: Option<DateTime<Utc>>,
}

impl EntityDefinition for Organizations {
    type Payload = OrganizationPayload;
    const KIND: EntityKind = EntityKind::Organization;

    fn path(id: i64) -> String {
        format!("/alliances/{}/", id)
    }

    fn into_data(id: i64, payload: Self::Payload) -> EntityData {
        EntityData {
            ticker: Some(payload.ticker),
            parent_id: payload.executor_corporation_id,
            founded_at: payload.date_founded,
            creator_id: payload.creator_id,
            ..EntityData::new(Self::KIND, id, payload.name)
        }
    }
}

/// Member organizations (corporations upstream).
pub struct Suborganizations;

#[derive(Debug, Deserialize)]
pub struct SuborganizationPayload {
    pub name: String,
    pub ticker: String,
    pub alliance_id: Option<i64>,
    pub member_count: Option<i64>,
    pub creator_id: Option<i64>,
    pub date_founded: Option<DateTime<Utc>>,
}

impl EntityDefinition for Suborganizations {
    type Payload = SuborganizationPayload;
    const KIND: EntityKind = EntityKind::Suborganization;

    fn path(id: i64) -> String {
        format!("/corporations/{}/", id)
    }

    fn into_data(id: i64, payload: Self::Payload) -> EntityData {
        EntityData {
            ticker: Some(payload.ticker),
            parent_id: payload.alliance_id,
            member_count: payload.member_count,
            founded_at: payload.date_founded,
            creator_id: payload.creator_id,
            ..EntityData::new(Self::KIND, id, payload.name)
        }
    }
}

/// Individuals (characters upstream).
pub struct Individuals;

#[derive(Debug, Deserialize)]
pub struct IndividualPayload {
    pub name: String,
    pub corporation_id: Option<i64>,
    pub birthday: Option<DateTime<Utc>>,
}

impl EntityDefinition for Individuals {
    type Payload = IndividualPayload;
    const KIND: EntityKind = EntityKind::Individual;

    fn path(id: i64) -> String {
        format!("/characters/{}/", id)
    }

    fn into_data(id: i64, payload: Self::Payload) -> EntityData {
        EntityData {
            parent_id: payload.corporation_id,
            founded_at: payload.birthday,
            ..EntityData::new(Self::KIND, id, payload.name)
        }
    }
}

/// Item types.
pub struct ItemTypes;

#[derive(Debug, Deserialize)]
pub struct ItemTypePayload {
    pub name: String,
    pub group_id: Option<i64>,
}

impl EntityDefinition for ItemTypes {
    type Payload = ItemTypePayload;
    const KIND: EntityKind = EntityKind::ItemType;

    fn path(id: i64) -> String {
        format!("/universe/types/{}/", id)
    }

    fn into_data(id: i64, payload: Self::Payload) -> EntityData {
        EntityData {
            parent_id: payload.group_id,
            ..EntityData::new(Self::KIND, id, payload.name)
        }
    }
}

/// One entry of the market price listing.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketPrice {
    pub type_id: i64,
    pub average_price: Option<f64>,
    pub adjusted_price: Option<f64>,
}

impl MarketPrice {
    /// Unit price used for valuation: average, falling back to adjusted.
    pub fn unit_price(&self) -> Option<f64> {
        self.average_price.or(self.adjusted_price)
    }
}
