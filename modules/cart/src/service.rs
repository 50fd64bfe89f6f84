//! Cart operations
//!
//! Every state change goes through the outbox: the cart document and the
//! CART_* envelope describing it are committed together, and publishing
//! happens later from the sweep.

use chrono::Utc;
use event_bus::{
    EntityStore, EventEnvelope, EventType, OutboxCoordinator, SourceService, StageError,
    StoreError,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{cart_total, Cart, CartStatus, LineItem, ShippingAddress, CARTS, KNOWN_USERS};

#[derive(Debug, thiserror::Error)]
pub enum CartError {
    #[error("invalid cart: {0}")]
    Validation(String),

    /// The user has not reached this service's replica yet; retry later
    #[error("user {0} is not known to the cart service")]
    UnknownUser(String),

    #[error("user already has active cart {0}")]
    AlreadyExists(String),

    #[error("cart {0} not found")]
    NotFound(String),

    #[error("cart {cart_id} is {status}, expected ACTIVE")]
    NotActive { cart_id: String, status: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stage(#[from] StageError),
}

pub struct CartService {
    entities: Arc<dyn EntityStore>,
    outbox: Arc<OutboxCoordinator>,
}

impl CartService {
    pub fn new(entities: Arc<dyn EntityStore>, outbox: Arc<OutboxCoordinator>) -> Self {
        Self { entities, outbox }
    }

    pub async fn get_cart(&self, cart_id: &str) -> Result<Option<Cart>, CartError> {
        match self
            .entities
            .find_one(CARTS, &json!({ "cartId": cart_id }))
            .await?
        {
            Some(doc) => Ok(Some(serde_json::from_value(doc).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    /// Open a cart for a user known from USER_CREATED
    pub async fn create_cart(&self, user_id: &str, items: Vec<LineItem>) -> Result<Cart, CartError> {
        validate_items(&items)?;

        let known = self
            .entities
            .find_one(KNOWN_USERS, &json!({ "userId": user_id }))
            .await?;
        if known.is_none() {
            return Err(CartError::UnknownUser(user_id.to_string()));
        }

        if let Some(existing) = self
            .entities
            .find_one(CARTS, &json!({ "userId": user_id, "status": CartStatus::Active.as_str() }))
            .await?
        {
            let cart_id = existing["cartId"].as_str().unwrap_or_default().to_string();
            return Err(CartError::AlreadyExists(cart_id));
        }

        let now = Utc::now();
        let cart = Cart {
            cart_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            total: cart_total(&items),
            items,
            status: CartStatus::Active,
            created_at: now,
            updated_at: now,
        };

        let staged = self
            .outbox
            .stage(
                |mutation| {
                    mutation.upsert(
                        CARTS,
                        json!({ "cartId": cart.cart_id }),
                        serde_json::to_value(&cart).map_err(StoreError::from)?,
                    );
                    Ok::<_, CartError>(cart)
                },
                |cart| {
                    EventEnvelope::new(
                        EventType::CartCreated,
                        SourceService::CartService,
                        json!({
                            "cartId": cart.cart_id,
                            "userId": cart.user_id,
                            "items": cart.items,
                            "total": cart.total,
                        }),
                    )
                },
            )
            .await?;

        tracing::info!(
            cart_id = %staged.value.cart_id,
            user_id = %staged.value.user_id,
            event_id = %staged.envelope.id(),
            "Cart created"
        );

        Ok(staged.value)
    }

    /// Replace the items of an active cart
    pub async fn update_items(&self, cart_id: &str, items: Vec<LineItem>) -> Result<Cart, CartError> {
        validate_items(&items)?;
        let mut cart = self.active_cart(cart_id).await?;

        cart.total = cart_total(&items);
        cart.items = items;
        cart.updated_at = Utc::now();

        let staged = self
            .outbox
            .stage(
                |mutation| {
                    mutation.upsert(
                        CARTS,
                        json!({ "cartId": cart.cart_id }),
                        serde_json::to_value(&cart).map_err(StoreError::from)?,
                    );
                    Ok::<_, CartError>(cart)
                },
                |cart| {
                    EventEnvelope::new(
                        EventType::CartUpdated,
                        SourceService::CartService,
                        json!({
                            "cartId": cart.cart_id,
                            "userId": cart.user_id,
                            "items": cart.items,
                            "total": cart.total,
                        }),
                    )
                },
            )
            .await?;

        tracing::info!(cart_id = %cart_id, event_id = %staged.envelope.id(), "Cart updated");
        Ok(staged.value)
    }

    /// Check out an active cart; the order service creates the order from CART_CONVERTED
    pub async fn convert_cart(
        &self,
        cart_id: &str,
        shipping_address: ShippingAddress,
    ) -> Result<Cart, CartError> {
        let mut cart = self.active_cart(cart_id).await?;

        cart.status = CartStatus::Converted;
        cart.updated_at = Utc::now();

        let staged = self
            .outbox
            .stage(
                |mutation| {
                    mutation.upsert(
                        CARTS,
                        json!({ "cartId": cart.cart_id }),
                        serde_json::to_value(&cart).map_err(StoreError::from)?,
                    );
                    Ok::<_, CartError>(cart)
                },
                |cart| {
                    EventEnvelope::new(
                        EventType::CartConverted,
                        SourceService::CartService,
                        json!({
                            "cartId": cart.cart_id,
                            "userId": cart.user_id,
                            "shippingAddress": shipping_address,
                        }),
                    )
                },
            )
            .await?;

        tracing::info!(cart_id = %cart_id, event_id = %staged.envelope.id(), "Cart converted");
        Ok(staged.value)
    }

    async fn active_cart(&self, cart_id: &str) -> Result<Cart, CartError> {
        let cart = self
            .get_cart(cart_id)
            .await?
            .ok_or_else(|| CartError::NotFound(cart_id.to_string()))?;

        if cart.status != CartStatus::Active {
            return Err(CartError::NotActive {
                cart_id: cart_id.to_string(),
                status: cart.status.as_str(),
            });
        }
        Ok(cart)
    }
}

fn validate_items(items: &[LineItem]) -> Result<(), CartError> {
    if items.is_empty() {
        return Err(CartError::Validation("at least one item is required".to_string()));
    }

    for item in items {
        if item.product_id.trim().is_empty() {
            return Err(CartError::Validation("productId must not be empty".to_string()));
        }
        if item.quantity == 0 {
            return Err(CartError::Validation(format!(
                "quantity for {} must be at least 1",
                item.product_id
            )));
        }
        if !item.price.is_finite() || item.price < 0.0 {
            return Err(CartError::Validation(format!(
                "price for {} must be a non-negative number",
                item.product_id
            )));
        }
    }

    Ok(())
}
