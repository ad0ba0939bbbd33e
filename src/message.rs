//! Queue names and the message envelope carried on every work queue.
//!
//! Every queue carries the same JSON shape:
//!
//! ```json
//! { "entityId": 12345, "queuedAt": "2024-05-01T11:00:00Z", "source": "discovery",
//!   "priority": 3, "mode": "fetch" }
//! ```
//!
//! Messages are decoded against the queue they were consumed from
//! ([`TypedMessage::decode`]), so a payload published to the wrong queue or
//! with out-of-range fields is rejected as malformed and dead-lettered.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority for lookups an operator asked for explicitly.
pub const PRIORITY_OPERATOR: u8 = 10;
/// Default publish priority.
pub const PRIORITY_DEFAULT: u8 = 5;
/// Priority for children fanned out by discovery.
pub const PRIORITY_DISCOVERY: u8 = 3;
/// Priority for bulk enumeration and backlog work.
pub const PRIORITY_BULK: u8 = 1;
/// Highest priority a queue is declared with.
pub const MAX_PRIORITY: u8 = 10;

/// Suffix appended to a queue name to form its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = "dead-letter";

/// Build the dead-letter queue name for a queue.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.{}", queue, DEAD_LETTER_SUFFIX)
}

/// Errors raised while decoding a delivery.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed message on {queue}: {reason}")]
    Malformed { queue: String, reason: String },

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),
}

/// The work queues of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Organizations to fetch and upsert.
    Organizations,
    /// Suborganizations to fetch and upsert.
    Suborganizations,
    /// Individuals to fetch and upsert.
    Individuals,
    /// Item types to fetch and upsert.
    ItemTypes,
    /// Organizations whose suborganizations should be listed.
    OrganizationDiscovery,
    /// Loss records waiting for value computation.
    LossValues,
}

impl Queue {
    /// All queues, in pipeline order.
    pub const ALL: [Queue; 6] = [
        Queue::Organizations,
        Queue::OrganizationDiscovery,
        Queue::Suborganizations,
        Queue::Individuals,
        Queue::ItemTypes,
        Queue::LossValues,
    ];

    /// Broker-side queue name.
    pub fn name(&self) -> &'static str {
        match self {
            Queue::Organizations => "killfeed.organizations",
            Queue::Suborganizations => "killfeed.suborganizations",
            Queue::Individuals => "killfeed.individuals",
            Queue::ItemTypes => "killfeed.item_types",
            Queue::OrganizationDiscovery => "killfeed.organization_discovery",
            Queue::LossValues => "killfeed.loss_values",
        }
    }

    /// Resolve a broker-side queue name.
    pub fn from_name(name: &str) -> Result<Self, MessageError> {
        Self::ALL
            .into_iter()
            .find(|q| q.name() == name)
            .ok_or_else(|| MessageError::UnknownQueue(name.to_string()))
    }

    /// Whether `mode: refresh` means anything on this queue.
    fn accepts_refresh(&self) -> bool {
        !matches!(self, Queue::OrganizationDiscovery)
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Queue {
    type Err = MessageError;

    /// Accepts either the broker name or the short form (`organizations`,
    /// `item_types`, `item-types`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(queue) = Self::from_name(s) {
            return Ok(queue);
        }
        let short = s.replace('-', "_");
        Self::from_name(&format!("killfeed.{}", short))
    }
}

/// How a worker should treat an entity it already has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Skip entities already present in storage.
    #[default]
    Fetch,
    /// Refetch and update even if present.
    Refresh,
}

/// Envelope published on every work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub entity_id: i64,
    pub queued_at: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
}

impl QueueMessage {
    /// Create a message stamped with the current time.
    pub fn new(entity_id: i64, source: impl Into<String>) -> Self {
        Self {
            entity_id,
            queued_at: Utc::now(),
            source: source.into(),
            priority: None,
            mode: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Effective mode (absent means [`Mode::Fetch`]).
    pub fn mode(&self) -> Mode {
        self.mode.unwrap_or_default()
    }

    /// Serialize to the JSON wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A message decoded against the queue it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedMessage {
    Organization(QueueMessage),
    Suborganization(QueueMessage),
    Individual(QueueMessage),
    ItemType(QueueMessage),
    Discovery(QueueMessage),
    LossValue(QueueMessage),
}

impl TypedMessage {
    /// Decode and validate a payload consumed from `queue`.
    pub fn decode(queue: Queue, payload: &[u8]) -> Result<Self, MessageError> {
        let malformed = |reason: String| MessageError::Malformed {
            queue: queue.name().to_string(),
            reason,
        };

        let message: QueueMessage =
            serde_json::from_slice(payload).map_err(|e| malformed(e.to_string()))?;

        if message.entity_id <= 0 {
            return Err(malformed(format!(
                "entityId must be positive, got {}",
                message.entity_id
            )));
        }
        if let Some(priority) = message.priority {
            if priority > MAX_PRIORITY {
                return Err(malformed(format!("priority {} out of range", priority)));
            }
        }
        if message.mode == Some(Mode::Refresh) && !queue.accepts_refresh() {
            return Err(malformed("refresh mode not valid here".to_string()));
        }

        Ok(match queue {
            Queue::Organizations => TypedMessage::Organization(message),
            Queue::Suborganizations => TypedMessage::Suborganization(message),
            Queue::Individuals => TypedMessage::Individual(message),
            Queue::ItemTypes => TypedMessage::ItemType(message),
            Queue::OrganizationDiscovery => TypedMessage::Discovery(message),
            Queue::LossValues => TypedMessage::LossValue(message),
        })
    }

    /// The queue this message belongs to.
    pub fn queue(&self) -> Queue {
        match self {
            TypedMessage::Organization(_) => Queue::Organizations,
            TypedMessage::Suborganization(_) => Queue::Suborganizations,
            TypedMessage::Individual(_) => Queue::Individuals,
            TypedMessage::ItemType(_) => Queue::ItemTypes,
            TypedMessage::Discovery(_) => Queue::OrganizationDiscovery,
            TypedMessage::LossValue(_) => Queue::LossValues,
        }
    }

    pub fn message(&self) -> &QueueMessage {
        match self {
            TypedMessage::Organization(m)
            | TypedMessage::Suborganization(m)
            | TypedMessage::Individual(m)
            | TypedMessage::ItemType(m)
            | TypedMessage::Discovery(m)
            | TypedMessage::LossValue(m) => m,
        }
    }

    pub fn into_message(self) -> QueueMessage {
        match self {
            TypedMessage::Organization(m)
            | TypedMessage::Suborganization(m)
            | TypedMessage::Individual(m)
            | TypedMessage::ItemType(m)
            | TypedMessage::Discovery(m)
            | TypedMessage::LossValue(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_field_names() {
        let msg = QueueMessage::new(12345, "operator").with_priority(PRIORITY_OPERATOR);
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes()).unwrap();

        assert_eq!(json["entityId"], 12345);
        assert_eq!(json["source"], "operator");
        assert_eq!(json["priority"], 10);
        assert!(json.get("mode").is_none());
        assert!(json["queuedAt"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_decode_minimal_payload() {
        let payload = br#"{"entityId": 99, "queuedAt": "2024-05-01T11:00:00Z", "source": "bulk"}"#;
        let typed = TypedMessage::decode(Queue::Individuals, payload).unwrap();

        assert_eq!(typed.queue(), Queue::Individuals);
        assert_eq!(typed.message().entity_id, 99);
        assert_eq!(typed.message().mode(), Mode::Fetch);
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let payload = br#"{"entityId": 99}"#;
        let err = TypedMessage::decode(Queue::Organizations, payload).unwrap_err();
        assert!(matches!(err, MessageError::Malformed { .. }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = TypedMessage::decode(Queue::Organizations, b"not json").unwrap_err();
        assert!(matches!(err, MessageError::Malformed { .. }));
    }

    #[test]
    fn test_decode_rejects_out_of_range_priority() {
        let payload =
            br#"{"entityId": 1, "queuedAt": "2024-05-01T11:00:00Z", "source": "x", "priority": 11}"#;
        assert!(TypedMessage::decode(Queue::Organizations, payload).is_err());
    }

    #[test]
    fn test_decode_rejects_non_positive_id() {
        let payload = br#"{"entityId": 0, "queuedAt": "2024-05-01T11:00:00Z", "source": "x"}"#;
        assert!(TypedMessage::decode(Queue::Organizations, payload).is_err());
    }

    #[test]
    fn test_refresh_not_accepted_on_discovery_queue() {
        let payload =
            br#"{"entityId": 1, "queuedAt": "2024-05-01T11:00:00Z", "source": "x", "mode": "refresh"}"#;
        assert!(TypedMessage::decode(Queue::OrganizationDiscovery, payload).is_err());
        assert!(TypedMessage::decode(Queue::Organizations, payload).is_ok());
    }

    #[test]
    fn test_queue_from_short_name() {
        assert_eq!("item-types".parse::<Queue>().unwrap(), Queue::ItemTypes);
        assert_eq!(
            "killfeed.loss_values".parse::<Queue>().unwrap(),
            Queue::LossValues
        );
        assert!("nope".parse::<Queue>().is_err());
    }

    #[test]
    fn test_dead_letter_queue_name() {
        assert_eq!(
            dead_letter_queue(Queue::Organizations.name()),
            "killfeed.organizations.dead-letter"
        );
    }
}
