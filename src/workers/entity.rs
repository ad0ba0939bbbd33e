//! Generic fetch-and-upsert worker, one instantiation per entity kind.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Outcome, Processor};
use crate::entity::EntityDefinition;
use crate::message::{Mode, Queue, TypedMessage};
use crate::storage::EntityStore;
use crate::upstream::RateLimitedClient;

/// Fetches entities of kind `D` the store does not have yet.
pub struct EntityWorker<D> {
    client: RateLimitedClient,
    store: Arc<dyn EntityStore>,
    _definition: PhantomData<fn() -> D>,
}

impl<D: EntityDefinition> EntityWorker<D> {
    pub fn new(client: RateLimitedClient, store: Arc<dyn EntityStore>) -> Self {
        Self {
            client,
            store,
            _definition: PhantomData,
        }
    }
}

#[async_trait]
impl<D: EntityDefinition> Processor for EntityWorker<D> {
    fn queue(&self) -> Queue {
        D::KIND.queue()
    }

    async fn process(&self, message: TypedMessage) -> Outcome {
        let message = message.into_message();
        let id = message.entity_id;

        // Skipping known ids is what keeps the upstream budget affordable.
        if message.mode() == Mode::Fetch {
            match self.store.exists(D::KIND, id).await {
                Ok(true) => return Outcome::Skipped,
                Ok(false) => {}
                Err(e) => return Outcome::Retry(e.to_string()),
            }
        }

        let payload = match self.client.get_json::<D::Payload>(&D::path(id)).await {
            Ok(payload) => payload,
            Err(e) => return e.into(),
        };

        match self.store.upsert(&D::into_data(id, payload)).await {
            Ok(upserted) => {
                debug!(kind = %D::KIND, id, ?upserted, "Entity stored");
                Outcome::Processed
            }
            Err(e) => Outcome::Retry(e.to_string()),
        }
    }
}
