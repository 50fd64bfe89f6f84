//! User service
//!
//! Owns user accounts and credentials, produces USER_CREATED and USER_UPDATED,
//! and consumes ORDER_* events from the `user-service` queue into each user's
//! order history.

pub mod config;
pub mod consumer;
pub mod credentials;
pub mod models;
pub mod service;

pub use consumer::{start_user_consumer, OrderHistoryHandler, USER_CONSUMER_ID};
pub use credentials::{AuthError, Claims, CredentialIssuer, JwtCredentials, PasswordPolicy};
pub use service::{UserError, UserService};
