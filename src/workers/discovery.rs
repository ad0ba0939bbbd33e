//! Fans organizations out into their suborganizations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Outcome, Processor};
use crate::bus::QueueBroker;
use crate::entity::suborganizations_path;
use crate::message::{Queue, QueueMessage, TypedMessage, PRIORITY_DISCOVERY};
use crate::upstream::RateLimitedClient;

/// Source tag on messages published by discovery.
pub const DISCOVERY_SOURCE: &str = "discovery";

/// Lists an organization's suborganization ids and queues each for fetch.
///
/// The parent itself is not stored here; the organization worker does that.
pub struct DiscoveryWorker {
    client: RateLimitedClient,
    broker: Arc<dyn QueueBroker>,
}

impl DiscoveryWorker {
    pub fn new(client: RateLimitedClient, broker: Arc<dyn QueueBroker>) -> Self {
        Self { client, broker }
    }
}

#[async_trait]
impl Processor for DiscoveryWorker {
    fn queue(&self) -> Queue {
        Queue::OrganizationDiscovery
    }

    fn publishes_to(&self) -> Vec<Queue> {
        vec![Queue::Suborganizations]
    }

    async fn process(&self, message: TypedMessage) -> Outcome {
        let organization_id = message.message().entity_id;

        let children: Vec<i64> = match self
            .client
            .get_json(&suborganizations_path(organization_id))
            .await
        {
            Ok(children) => children,
            Err(e) => return e.into(),
        };

        if children.is_empty() {
            debug!(organization_id, "No suborganizations");
            return Outcome::Processed;
        }

        let messages: Vec<QueueMessage> = children
            .into_iter()
            .map(|id| QueueMessage::new(id, DISCOVERY_SOURCE).with_priority(PRIORITY_DISCOVERY))
            .collect();

        // A partial publish is retried whole; duplicates are skipped downstream.
        match self
            .broker
            .publish_batch(Queue::Suborganizations.name(), &messages)
            .await
        {
            Ok(published) => {
                debug!(organization_id, published, "Suborganizations queued");
                Outcome::Processed
            }
            Err(e) => Outcome::Retry(e.to_string()),
        }
    }
}
