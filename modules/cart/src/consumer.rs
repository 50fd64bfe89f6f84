//! USER_* consumer maintaining the cart service's replica of users

use async_trait::async_trait;
use event_bus::publisher::CART_SERVICE_QUEUE;
use event_bus::{
    ConsumerConfig, ConsumerHandle, ConsumerLoop, EntityStore, EventEnvelope, EventHandler,
    EventType, HandlerError, HandlerRegistry, QueueTransport, Stores,
};
use serde_json::json;
use std::sync::Arc;

use crate::models::{KnownUser, UserPayload, KNOWN_USERS};

pub const CART_CONSUMER_ID: &str = "cart-consumer";

/// Upserts `known_users` from USER_CREATED and USER_UPDATED
///
/// Events can arrive out of order, so a replica built from a newer event is
/// never overwritten by an older one.
pub struct UserReplicaHandler {
    entities: Arc<dyn EntityStore>,
}

impl UserReplicaHandler {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl EventHandler for UserReplicaHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let payload: UserPayload = envelope
            .payload_as()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let filter = json!({ "userId": payload.user_id });

        let existing = self
            .entities
            .find_one(KNOWN_USERS, &filter)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?
            .and_then(|doc| serde_json::from_value::<KnownUser>(doc).ok());

        if let Some(existing) = existing {
            if existing.last_event_at > envelope.occurred_at() {
                tracing::debug!(
                    event_id = %envelope.id(),
                    user_id = %payload.user_id,
                    "Replica already newer than event, skipping"
                );
                return Ok(());
            }
        }

        let replica = KnownUser {
            user_id: payload.user_id,
            email: payload.email,
            first_name: payload.first_name,
            last_name: payload.last_name,
            last_event_at: envelope.occurred_at(),
        };

        let document =
            serde_json::to_value(&replica).map_err(|e| HandlerError::Fatal(e.to_string()))?;

        self.entities
            .upsert(KNOWN_USERS, &filter, document)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        tracing::info!(
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            user_id = %replica.user_id,
            "User replica updated"
        );
        Ok(())
    }
}

pub fn handlers(entities: Arc<dyn EntityStore>) -> HandlerRegistry {
    let replica: Arc<dyn EventHandler> = Arc::new(UserReplicaHandler::new(entities));
    HandlerRegistry::new()
        .on(EventType::UserCreated, replica.clone())
        .on(EventType::UserUpdated, replica)
}

pub fn default_consumer_config() -> ConsumerConfig {
    ConsumerConfig::new(CART_CONSUMER_ID, CART_SERVICE_QUEUE)
}

/// Spawn the cart service's consumer loop on the `cart-service` queue
pub fn start_cart_consumer(
    config: ConsumerConfig,
    transport: Arc<dyn QueueTransport>,
    stores: &Stores,
) -> ConsumerHandle {
    tracing::info!(queue = %config.queue, "Starting cart consumer");

    ConsumerLoop::new(
        config,
        transport,
        handlers(stores.entities.clone()),
        stores.processed.clone(),
        stores.dead_letters.clone(),
    )
    .spawn()
}
