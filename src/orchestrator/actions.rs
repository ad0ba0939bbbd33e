//! Stage actions of the daily workflow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use tracing::{info, warn};

use super::{Result, StageAction, WorkflowStage};
use crate::bus::{BusError, QueueBroker};
use crate::config::OrchestratorConfig;
use crate::entity::{EntityKind, MarketPrice, MARKET_PRICES_PATH, ORGANIZATION_LIST_PATH};
use crate::loss::ItemPrice;
use crate::message::{Queue, QueueMessage, PRIORITY_BULK};
use crate::storage::{EntityStore, LossStore, PriceStore, Stores};
use crate::upstream::RateLimitedClient;
use crate::utils::retry::publish_backoff;

/// Source tag on messages published by the orchestrator.
pub const ORCHESTRATOR_SOURCE: &str = "orchestrator";

/// Publish `ids` at bulk priority.
///
/// An interrupted batch is republished whole; consumers are idempotent.
async fn publish_ids(broker: &dyn QueueBroker, queue: Queue, ids: Vec<i64>) -> Result<usize> {
    let messages: Vec<QueueMessage> = ids
        .into_iter()
        .map(|id| QueueMessage::new(id, ORCHESTRATOR_SOURCE).with_priority(PRIORITY_BULK))
        .collect();

    let publish = || broker.publish_batch(queue.name(), &messages);
    let published = publish
        .retry(publish_backoff())
        .when(|e: &BusError| !matches!(e, BusError::UnknownQueue(_)))
        .notify(|e: &BusError, delay| {
            warn!(
                queue = %queue,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Batch publish failed"
            );
        })
        .await?;
    Ok(published)
}

/// Queue every organization the upstream lists.
pub struct EnumerateOrganizations {
    client: RateLimitedClient,
    broker: Arc<dyn QueueBroker>,
}

impl EnumerateOrganizations {
    pub fn new(client: RateLimitedClient, broker: Arc<dyn QueueBroker>) -> Self {
        Self { client, broker }
    }
}

#[async_trait]
impl StageAction for EnumerateOrganizations {
    async fn run(&self) -> Result<usize> {
        let ids: Vec<i64> = self.client.get_json(ORGANIZATION_LIST_PATH).await?;
        info!(organizations = ids.len(), "Enumerated organizations");
        publish_ids(self.broker.as_ref(), Queue::Organizations, ids).await
    }
}

/// Queue every stored organization for suborganization discovery.
pub struct PublishStoredOrganizations {
    store: Arc<dyn EntityStore>,
    broker: Arc<dyn QueueBroker>,
}

impl PublishStoredOrganizations {
    pub fn new(store: Arc<dyn EntityStore>, broker: Arc<dyn QueueBroker>) -> Self {
        Self { store, broker }
    }
}

#[async_trait]
impl StageAction for PublishStoredOrganizations {
    async fn run(&self) -> Result<usize> {
        let ids = self.store.list_ids(EntityKind::Organization).await?;
        publish_ids(self.broker.as_ref(), Queue::OrganizationDiscovery, ids).await
    }
}

/// Does nothing; the stage only waits for its queue.
pub struct WaitOnly;

#[async_trait]
impl StageAction for WaitOnly {
    async fn run(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Reload market prices, then queue every loss without a value.
pub struct RefreshPricesAndBacklog {
    client: RateLimitedClient,
    prices: Arc<dyn PriceStore>,
    losses: Arc<dyn LossStore>,
    broker: Arc<dyn QueueBroker>,
}

impl RefreshPricesAndBacklog {
    pub fn new(
        client: RateLimitedClient,
        prices: Arc<dyn PriceStore>,
        losses: Arc<dyn LossStore>,
        broker: Arc<dyn QueueBroker>,
    ) -> Self {
        Self {
            client,
            prices,
            losses,
            broker,
        }
    }
}

#[async_trait]
impl StageAction for RefreshPricesAndBacklog {
    async fn run(&self) -> Result<usize> {
        let market: Vec<MarketPrice> = self.client.get_json(MARKET_PRICES_PATH).await?;
        let prices: Vec<ItemPrice> = market
            .iter()
            .filter_map(|entry| {
                entry.unit_price().map(|price| ItemPrice {
                    type_id: entry.type_id,
                    price,
                })
            })
            .collect();
        let stored = self.prices.upsert_prices(&prices).await?;
        info!(stored, listed = market.len(), "Market prices refreshed");

        let backlog = self.losses.unvalued_loss_ids().await?;
        publish_ids(self.broker.as_ref(), Queue::LossValues, backlog).await
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// The daily workflow: organizations, discovery, suborganizations, values.
pub fn default_stages(
    config: &OrchestratorConfig,
    client: RateLimitedClient,
    broker: Arc<dyn QueueBroker>,
    stores: &Stores,
) -> Vec<WorkflowStage> {
    let timeouts = &config.timeouts;
    vec![
        WorkflowStage::new(
            "organizations",
            Arc::new(EnumerateOrganizations::new(client.clone(), broker.clone())),
            Queue::Organizations,
            minutes(timeouts.organizations),
        ),
        WorkflowStage::new(
            "discovery",
            Arc::new(PublishStoredOrganizations::new(
                stores.entities.clone(),
                broker.clone(),
            )),
            Queue::OrganizationDiscovery,
            minutes(timeouts.discovery),
        ),
        WorkflowStage::new(
            "suborganizations",
            Arc::new(WaitOnly),
            Queue::Suborganizations,
            minutes(timeouts.suborganizations),
        ),
        WorkflowStage::new(
            "values",
            Arc::new(RefreshPricesAndBacklog::new(
                client,
                stores.prices.clone(),
                stores.losses.clone(),
                broker,
            )),
            Queue::LossValues,
            minutes(timeouts.values),
        ),
    ]
}
