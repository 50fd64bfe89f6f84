//! Cart service
//!
//! Consumes USER_* events from the `cart-service` queue into a local user
//! replica and produces CART_CREATED, CART_UPDATED and CART_CONVERTED.

pub mod config;
pub mod consumer;
pub mod models;
pub mod service;

pub use consumer::{start_cart_consumer, UserReplicaHandler, CART_CONSUMER_ID};
pub use service::{CartError, CartService};
