//! Order operations
//!
//! Orders are created from CART_CONVERTED on the consumer side and moved
//! through their lifecycle by the operations below; each change stages its
//! ORDER_* event in the same commit as the order document.

use chrono::Utc;
use event_bus::{
    EntityStore, EventEnvelope, EventType, OutboxCoordinator, SourceService, StageError,
    StoreError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    order_created_event_id, order_id_for, CartSnapshot, Order, OrderStatus, PaymentStatus,
    ShippingAddress, CART_SNAPSHOTS, ORDERS,
};

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    /// The CART_CREATED for this cart has not been applied here yet
    #[error("no snapshot for cart {0} yet")]
    SnapshotMissing(String),

    #[error("order {0} not found")]
    NotFound(String),

    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stage(#[from] StageError),
}

pub struct OrderService {
    entities: Arc<dyn EntityStore>,
    outbox: Arc<OutboxCoordinator>,
}

impl OrderService {
    pub fn new(entities: Arc<dyn EntityStore>, outbox: Arc<OutboxCoordinator>) -> Self {
        Self { entities, outbox }
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>, OrderError> {
        match self
            .entities
            .find_one(ORDERS, &json!({ "orderId": order_id }))
            .await?
        {
            Some(doc) => Ok(Some(serde_json::from_value(doc).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    /// Create the order for a converted cart
    ///
    /// The order id and the ORDER_CREATED envelope id are both derived from
    /// `trigger`, the CART_CONVERTED event id, so applying the same event
    /// twice returns the existing order and stages nothing new.
    pub async fn create_from_converted_cart(
        &self,
        trigger: Uuid,
        cart_id: &str,
        user_id: &str,
        shipping_address: Option<ShippingAddress>,
    ) -> Result<Order, OrderError> {
        let order_id = order_id_for(trigger).to_string();

        if let Some(existing) = self.get_order(&order_id).await? {
            tracing::debug!(order_id = %order_id, "Order already created for this conversion");
            return Ok(existing);
        }

        let snapshot: CartSnapshot = match self
            .entities
            .find_one(CART_SNAPSHOTS, &json!({ "cartId": cart_id }))
            .await?
        {
            Some(doc) => serde_json::from_value(doc).map_err(StoreError::from)?,
            None => return Err(OrderError::SnapshotMissing(cart_id.to_string())),
        };

        let now = Utc::now();
        let order = Order {
            order_id,
            user_id: user_id.to_string(),
            cart_id: cart_id.to_string(),
            items: snapshot.items,
            total: snapshot.total,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            shipping_address,
            created_at: now,
            updated_at: now,
        };

        let staged = self
            .outbox
            .stage(
                |mutation| {
                    mutation.upsert(
                        ORDERS,
                        json!({ "orderId": order.order_id }),
                        serde_json::to_value(&order).map_err(StoreError::from)?,
                    );
                    Ok::<_, OrderError>(order)
                },
                |order| {
                    EventEnvelope::with_id(
                        order_created_event_id(trigger),
                        EventType::OrderCreated,
                        SourceService::OrderService,
                        json!({
                            "orderId": order.order_id,
                            "userId": order.user_id,
                            "cartId": order.cart_id,
                            "items": order.items,
                            "total": order.total,
                            "status": order.status,
                        }),
                    )
                },
            )
            .await?;

        tracing::info!(
            order_id = %staged.value.order_id,
            cart_id = %cart_id,
            event_id = %staged.envelope.id(),
            "Order created from converted cart"
        );
        Ok(staged.value)
    }

    /// Move an order along PENDING -> PROCESSING -> COMPLETED, or cancel it
    pub async fn update_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, OrderError> {
        let mut order = self.existing(order_id).await?;

        if !order.status.can_transition_to(status) {
            return Err(OrderError::InvalidTransition {
                order_id: order_id.to_string(),
                from: order.status.as_str(),
                to: status.as_str(),
            });
        }

        order.status = status;
        order.updated_at = Utc::now();

        let staged = self
            .stage_change(order, EventType::OrderUpdated, |order| {
                json!({
                    "orderId": order.order_id,
                    "userId": order.user_id,
                    "status": order.status,
                    "total": order.total,
                })
            })
            .await?;

        tracing::info!(
            order_id = %order_id,
            status = %status.as_str(),
            event_id = %staged.1,
            "Order status updated"
        );
        Ok(staged.0)
    }

    /// Mark an open order paid and completed
    pub async fn complete_order(&self, order_id: &str) -> Result<Order, OrderError> {
        let mut order = self.existing(order_id).await?;

        if order.status.is_final() {
            return Err(OrderError::InvalidTransition {
                order_id: order_id.to_string(),
                from: order.status.as_str(),
                to: OrderStatus::Completed.as_str(),
            });
        }

        order.status = OrderStatus::Completed;
        order.payment_status = PaymentStatus::Paid;
        order.updated_at = Utc::now();

        let staged = self
            .stage_change(order, EventType::OrderCompleted, |order| {
                json!({
                    "orderId": order.order_id,
                    "userId": order.user_id,
                    "status": order.status,
                    "paymentStatus": order.payment_status,
                    "total": order.total,
                })
            })
            .await?;

        tracing::info!(order_id = %order_id, event_id = %staged.1, "Order completed");
        Ok(staged.0)
    }

    async fn existing(&self, order_id: &str) -> Result<Order, OrderError> {
        self.get_order(order_id)
            .await?
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))
    }

    async fn stage_change(
        &self,
        order: Order,
        event_type: EventType,
        payload: impl FnOnce(&Order) -> Value,
    ) -> Result<(Order, Uuid), OrderError> {
        let staged = self
            .outbox
            .stage(
                |mutation| {
                    mutation.upsert(
                        ORDERS,
                        json!({ "orderId": order.order_id }),
                        serde_json::to_value(&order).map_err(StoreError::from)?,
                    );
                    Ok::<_, OrderError>(order)
                },
                |order| EventEnvelope::new(event_type, SourceService::OrderService, payload(order)),
            )
            .await?;

        Ok((staged.value, staged.envelope.id()))
    }
}
