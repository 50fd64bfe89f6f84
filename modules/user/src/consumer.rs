//! ORDER_* consumer keeping each user's order history

use async_trait::async_trait;
use event_bus::publisher::USER_SERVICE_QUEUE;
use event_bus::{
    ConsumerConfig, ConsumerHandle, ConsumerLoop, EntityStore, EventEnvelope, EventHandler,
    EventType, HandlerError, HandlerRegistry, QueueTransport, Stores,
};
use serde_json::json;
use std::sync::Arc;

use crate::models::{OrderHistoryEntry, OrderPayload, ORDER_HISTORY, USERS};

pub const USER_CONSUMER_ID: &str = "user-consumer";

/// Upserts one `order_history` entry per (user, order)
///
/// Users are created here before any order can exist for them, so an order
/// naming an unknown user will never succeed and is dead-lettered.
pub struct OrderHistoryHandler {
    entities: Arc<dyn EntityStore>,
}

impl OrderHistoryHandler {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl EventHandler for OrderHistoryHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let payload: OrderPayload = envelope
            .payload_as()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let user = self
            .entities
            .find_one(USERS, &json!({ "userId": payload.user_id }))
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;
        if user.is_none() {
            return Err(HandlerError::Fatal(format!(
                "order {} references unknown user {}",
                payload.order_id, payload.user_id
            )));
        }

        let filter = json!({ "userId": payload.user_id, "orderId": payload.order_id });

        let existing = self
            .entities
            .find_one(ORDER_HISTORY, &filter)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?
            .and_then(|doc| serde_json::from_value::<OrderHistoryEntry>(doc).ok());

        if let Some(existing) = existing {
            if existing.last_event_at > envelope.occurred_at() {
                tracing::debug!(
                    event_id = %envelope.id(),
                    order_id = %payload.order_id,
                    "History entry already newer than event, skipping"
                );
                return Ok(());
            }
        }

        let entry = OrderHistoryEntry {
            user_id: payload.user_id,
            order_id: payload.order_id,
            status: payload.status,
            total: payload.total,
            last_event_at: envelope.occurred_at(),
        };

        let document =
            serde_json::to_value(&entry).map_err(|e| HandlerError::Fatal(e.to_string()))?;

        self.entities
            .upsert(ORDER_HISTORY, &filter, document)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        tracing::info!(
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            user_id = %entry.user_id,
            order_id = %entry.order_id,
            status = %entry.status,
            "Order history updated"
        );
        Ok(())
    }
}

pub fn handlers(entities: Arc<dyn EntityStore>) -> HandlerRegistry {
    let history: Arc<dyn EventHandler> = Arc::new(OrderHistoryHandler::new(entities));
    HandlerRegistry::new()
        .on(EventType::OrderCreated, history.clone())
        .on(EventType::OrderUpdated, history.clone())
        .on(EventType::OrderCompleted, history)
}

pub fn default_consumer_config() -> ConsumerConfig {
    ConsumerConfig::new(USER_CONSUMER_ID, USER_SERVICE_QUEUE)
}

/// Spawn the user service's consumer loop on the `user-service` queue
pub fn start_user_consumer(
    config: ConsumerConfig,
    transport: Arc<dyn QueueTransport>,
    stores: &Stores,
) -> ConsumerHandle {
    tracing::info!(queue = %config.queue, "Starting user consumer");

    ConsumerLoop::new(
        config,
        transport,
        handlers(stores.entities.clone()),
        stores.processed.clone(),
        stores.dead_letters.clone(),
    )
    .spawn()
}
