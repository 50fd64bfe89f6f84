//! Storage backends for entities, the outbox, processed events and dead letters
//!
//! [`MemoryStore`] keeps everything behind one lock for dev and tests.
//! [`PgStore`] is the production backend on Postgres.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::dlq::DeadLetterSink;
use crate::idempotency::IdempotencyGuard;
use crate::outbox::OutboxStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Document store used by the services for their own entities
///
/// A filter is a JSON object of field equalities; a document matches when
/// every filter field is present with an equal value.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Replace the first document matching `filter`, or insert `document`
    async fn upsert(&self, collection: &str, filter: &Value, document: Value)
        -> Result<(), StoreError>;

    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Option<Value>, StoreError>;
}

/// The four store roles a service needs, backed by one database
#[derive(Clone)]
pub struct Stores {
    pub entities: Arc<dyn EntityStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub processed: Arc<dyn IdempotencyGuard>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl Stores {
    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            entities: store.clone(),
            outbox: store.clone(),
            processed: store.clone(),
            dead_letters: store,
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            entities: store.clone(),
            outbox: store.clone(),
            processed: store.clone(),
            dead_letters: store,
        }
    }
}

/// Whether `document` contains every field of `filter` with an equal value
pub(crate) fn matches_filter(document: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(key, expected)| document.get(key) == Some(expected)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matching() {
        let doc = json!({"cartId": "c1", "userId": "u1", "status": "ACTIVE"});

        assert!(matches_filter(&doc, &json!({"cartId": "c1"})));
        assert!(matches_filter(&doc, &json!({"userId": "u1", "status": "ACTIVE"})));
        assert!(!matches_filter(&doc, &json!({"userId": "u2"})));
        assert!(!matches_filter(&doc, &json!({"missing": true})));
        assert!(matches_filter(&doc, &json!({})));
        assert!(!matches_filter(&doc, &json!("c1")));
    }
}
