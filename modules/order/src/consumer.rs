//! CART_* consumer: keeps cart snapshots and turns converted carts into orders

use async_trait::async_trait;
use event_bus::publisher::ORDER_SERVICE_QUEUE;
use event_bus::{
    ConsumerConfig, ConsumerHandle, ConsumerLoop, EntityStore, EventEnvelope, EventHandler,
    EventType, HandlerError, HandlerRegistry, OutboxCoordinator, QueueTransport, StageError,
    Stores,
};
use serde_json::json;
use std::sync::Arc;

use crate::models::{CartConvertedPayload, CartPayload, CartSnapshot, CART_SNAPSHOTS};
use crate::service::{OrderError, OrderService};

pub const ORDER_CONSUMER_ID: &str = "order-consumer";

impl From<OrderError> for HandlerError {
    fn from(err: OrderError) -> Self {
        match err {
            // CART_CONVERTED overtook CART_CREATED; redelivery gives it time to land
            OrderError::SnapshotMissing(_) => HandlerError::Retryable(err.to_string()),
            OrderError::Store(_) | OrderError::Stage(StageError::Store(_)) => {
                HandlerError::Retryable(err.to_string())
            }
            OrderError::Stage(StageError::Malformed(_))
            | OrderError::NotFound(_)
            | OrderError::InvalidTransition { .. } => HandlerError::Fatal(err.to_string()),
        }
    }
}

/// Upserts `cart_snapshots` from CART_CREATED and CART_UPDATED
pub struct CartSnapshotHandler {
    entities: Arc<dyn EntityStore>,
}

impl CartSnapshotHandler {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl EventHandler for CartSnapshotHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let payload: CartPayload = envelope
            .payload_as()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let filter = json!({ "cartId": payload.cart_id });

        let existing = self
            .entities
            .find_one(CART_SNAPSHOTS, &filter)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?
            .and_then(|doc| serde_json::from_value::<CartSnapshot>(doc).ok());

        if let Some(existing) = existing {
            if existing.last_event_at > envelope.occurred_at() {
                tracing::debug!(
                    event_id = %envelope.id(),
                    cart_id = %payload.cart_id,
                    "Snapshot already newer than event, skipping"
                );
                return Ok(());
            }
        }

        let snapshot = CartSnapshot {
            cart_id: payload.cart_id,
            user_id: payload.user_id,
            items: payload.items,
            total: payload.total,
            last_event_at: envelope.occurred_at(),
        };

        let document =
            serde_json::to_value(&snapshot).map_err(|e| HandlerError::Fatal(e.to_string()))?;

        self.entities
            .upsert(CART_SNAPSHOTS, &filter, document)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        tracing::info!(
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            cart_id = %snapshot.cart_id,
            total = snapshot.total,
            "Cart snapshot updated"
        );
        Ok(())
    }
}

/// Creates the order for a CART_CONVERTED event
pub struct CartConvertedHandler {
    orders: Arc<OrderService>,
}

impl CartConvertedHandler {
    pub fn new(orders: Arc<OrderService>) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl EventHandler for CartConvertedHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let payload: CartConvertedPayload = envelope
            .payload_as()
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        self.orders
            .create_from_converted_cart(
                envelope.id(),
                &payload.cart_id,
                &payload.user_id,
                payload.shipping_address,
            )
            .await?;
        Ok(())
    }
}

pub fn handlers(entities: Arc<dyn EntityStore>, outbox: Arc<OutboxCoordinator>) -> HandlerRegistry {
    let snapshots: Arc<dyn EventHandler> = Arc::new(CartSnapshotHandler::new(entities.clone()));
    let orders = Arc::new(OrderService::new(entities, outbox));

    HandlerRegistry::new()
        .on(EventType::CartCreated, snapshots.clone())
        .on(EventType::CartUpdated, snapshots)
        .on(EventType::CartConverted, Arc::new(CartConvertedHandler::new(orders)))
}

pub fn default_consumer_config() -> ConsumerConfig {
    ConsumerConfig::new(ORDER_CONSUMER_ID, ORDER_SERVICE_QUEUE)
}

/// Spawn the order service's consumer loop on the `order-service` queue
pub fn start_order_consumer(
    config: ConsumerConfig,
    transport: Arc<dyn QueueTransport>,
    stores: &Stores,
    outbox: Arc<OutboxCoordinator>,
) -> ConsumerHandle {
    tracing::info!(queue = %config.queue, "Starting order consumer");

    ConsumerLoop::new(
        config,
        transport,
        handlers(stores.entities.clone(), outbox),
        stores.processed.clone(),
        stores.dead_letters.clone(),
    )
    .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::MalformedEventError;

    #[test]
    fn test_order_errors_classified() {
        assert!(matches!(
            HandlerError::from(OrderError::SnapshotMissing("c1".to_string())),
            HandlerError::Retryable(_)
        ));
        assert!(matches!(
            HandlerError::from(OrderError::Store(event_bus::StoreError::Unavailable(
                "down".to_string()
            ))),
            HandlerError::Retryable(_)
        ));
        assert!(matches!(
            HandlerError::from(OrderError::Stage(StageError::Malformed(
                MalformedEventError::MissingField("userId")
            ))),
            HandlerError::Fatal(_)
        ));
    }
}
