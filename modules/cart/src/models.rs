use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CARTS: &str = "carts";
pub const KNOWN_USERS: &str = "known_users";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    pub quantity: u32,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CartStatus {
    Active,
    Converted,
    Abandoned,
}

impl CartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Active => "ACTIVE",
            CartStatus::Converted => "CONVERTED",
            CartStatus::Abandoned => "ABANDONED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub cart_id: String,
    pub user_id: String,
    pub items: Vec<LineItem>,
    pub total: f64,
    pub status: CartStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
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

/// Local replica of a user, fed by USER_CREATED / USER_UPDATED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownUser {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// `occurredAt` of the event this replica was last built from
    pub last_event_at: DateTime<Utc>,
}

/// USER_* payload as consumed here
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Sum of price times quantity, rounded to cents
pub fn cart_total(items: &[LineItem]) -> f64 {
    let total: f64 = items
        .iter()
        .map(|item| item.price * f64::from(item.quantity))
        .sum();
    (total * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(price: f64, quantity: u32) -> LineItem {
        LineItem {
            product_id: "p1".to_string(),
            quantity,
            price,
            name: None,
        }
    }

    #[test]
    fn test_cart_total() {
        assert_eq!(cart_total(&[item(10.0, 2), item(22.5, 1)]), 42.5);
        assert_eq!(cart_total(&[item(0.1, 3)]), 0.3);
        assert_eq!(cart_total(&[]), 0.0);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(CartStatus::Converted).unwrap(),
            serde_json::json!("CONVERTED")
        );
    }
}
