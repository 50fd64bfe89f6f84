use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ORDERS: &str = "orders";
pub const CART_SNAPSHOTS: &str = "cart_snapshots";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// PENDING -> PROCESSING -> COMPLETED, and any non-final status -> CANCELLED
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Pending, OrderStatus::Processing) => true,
            (OrderStatus::Processing, OrderStatus::Completed) => true,
            (current, OrderStatus::Cancelled) => !current.is_final(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub cart_id: String,
    pub items: Vec<OrderItem>,
    pub total: f64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The order service's view of a cart, fed by CART_CREATED / CART_UPDATED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSnapshot {
    pub cart_id: String,
    pub user_id: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    pub total: f64,
    pub last_event_at: DateTime<Utc>,
}

/// CART_CREATED / CART_UPDATED payload as consumed here
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartPayload {
    pub cart_id: String,
    pub user_id: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    pub total: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartConvertedPayload {
    pub cart_id: String,
    pub user_id: String,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
}

/// Order id for the CART_CONVERTED event `trigger`; the same trigger always yields the same order
pub fn order_id_for(trigger: Uuid) -> Uuid {
    Uuid::new_v5(&trigger, b"order")
}

/// Envelope id of the ORDER_CREATED emitted for the CART_CONVERTED event `trigger`
pub fn order_created_event_id(trigger: Uuid) -> Uuid {
    Uuid::new_v5(&trigger, b"ORDER_CREATED")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use OrderStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_derived_ids_are_stable_and_distinct() {
        let trigger = Uuid::new_v4();

        assert_eq!(order_id_for(trigger), order_id_for(trigger));
        assert_ne!(order_id_for(trigger), order_created_event_id(trigger));
        assert_ne!(order_id_for(trigger), order_id_for(Uuid::new_v4()));
    }
}
