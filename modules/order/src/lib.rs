//! Order service
//!
//! Consumes CART_* events from the `order-service` queue. Cart snapshots are
//! kept from CART_CREATED / CART_UPDATED; CART_CONVERTED creates the order
//! and ORDER_CREATED, ORDER_UPDATED and ORDER_COMPLETED go out through the
//! outbox.

pub mod config;
pub mod consumer;
pub mod models;
pub mod service;

pub use consumer::{start_order_consumer, CartConvertedHandler, CartSnapshotHandler, ORDER_CONSUMER_ID};
pub use service::{OrderError, OrderService};
