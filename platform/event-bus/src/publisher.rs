//! Publisher: hands envelopes to the queues of their consumer groups
//!
//! The publisher never creates event ids. Staged envelopes keep their id
//! across every retry, so a duplicate send is harmless: consumers
//! deduplicate on the envelope id, not on transport message identity.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::retry::{retry_if, RetryConfig};
use crate::{BusError, EventEnvelope, EventType, QueueTransport};

/// Logical queue consumed by the cart service
pub const CART_SERVICE_QUEUE: &str = "cart-service";
/// Logical queue consumed by the order service
pub const ORDER_SERVICE_QUEUE: &str = "order-service";
/// Logical queue consumed by the user service
pub const USER_SERVICE_QUEUE: &str = "user-service";

/// Routing table from event type to the queues of interested consumer groups
///
/// There is one queue per downstream service, not per event type.
#[derive(Debug, Clone, Default)]
pub struct QueueRoutes {
    routes: HashMap<EventType, Vec<String>>,
}

impl QueueRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `event_type` to `queue` in addition to any existing queues
    pub fn route(mut self, event_type: EventType, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        let queues = self.routes.entry(event_type).or_default();
        if !queues.contains(&queue) {
            queues.push(queue);
        }
        self
    }

    /// The commerce topology: user events feed the cart service, cart events
    /// feed the order service, order events feed the user service
    pub fn commerce() -> Self {
        Self::new()
            .route(EventType::UserCreated, CART_SERVICE_QUEUE)
            .route(EventType::UserUpdated, CART_SERVICE_QUEUE)
            .route(EventType::CartCreated, ORDER_SERVICE_QUEUE)
            .route(EventType::CartUpdated, ORDER_SERVICE_QUEUE)
            .route(EventType::CartConverted, ORDER_SERVICE_QUEUE)
            .route(EventType::OrderCreated, USER_SERVICE_QUEUE)
            .route(EventType::OrderUpdated, USER_SERVICE_QUEUE)
            .route(EventType::OrderCompleted, USER_SERVICE_QUEUE)
    }

    pub fn queues_for(&self, event_type: &EventType) -> &[String] {
        self.routes
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Proof that every routed queue accepted the envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub event_id: Uuid,
    pub queues: Vec<String>,
}

/// Errors surfaced by [`Publisher::publish`] once its own retries are spent
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("publish throttled: {0}")]
    Throttled(String),

    #[error("envelope of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl PublishError {
    /// Whether a later attempt with the same envelope can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Unavailable(_) | PublishError::Throttled(_))
    }
}

impl From<BusError> for PublishError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Throttled(msg) => PublishError::Throttled(msg),
            BusError::PayloadTooLarge { size, limit } => {
                PublishError::PayloadTooLarge { size, limit }
            }
            BusError::SerializationError(msg) => PublishError::Encode(msg),
            other => PublishError::Unavailable(other.to_string()),
        }
    }
}

/// Sends envelopes to every queue routed for their type
pub struct Publisher {
    transport: Arc<dyn QueueTransport>,
    routes: QueueRoutes,
    retry: RetryConfig,
    max_message_bytes: usize,
}

impl Publisher {
    /// Largest encoded envelope accepted (256 KiB, the managed-queue limit)
    pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

    pub fn new(transport: Arc<dyn QueueTransport>, routes: QueueRoutes) -> Self {
        Self {
            transport,
            routes,
            retry: RetryConfig::default(),
            max_message_bytes: Self::DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn routes(&self) -> &QueueRoutes {
        &self.routes
    }

    /// Publish an envelope to every queue routed for its type
    ///
    /// Each queue is retried with bounded exponential backoff. On `Ack` the
    /// transport holds the message for every routed consumer group. On
    /// `PublishError` the caller must retry later with the same envelope;
    /// queues that already accepted it will simply see a duplicate.
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<Ack, PublishError> {
        let queues = self.routes.queues_for(envelope.event_type());

        if queues.is_empty() {
            tracing::warn!(
                event_id = %envelope.id(),
                event_type = %envelope.event_type(),
                "No queue routed for event type, nothing to publish"
            );
            return Ok(Ack {
                event_id: envelope.id(),
                queues: Vec::new(),
            });
        }

        let body = envelope
            .to_vec()
            .map_err(|e| PublishError::Encode(e.to_string()))?;

        if body.len() > self.max_message_bytes {
            return Err(PublishError::PayloadTooLarge {
                size: body.len(),
                limit: self.max_message_bytes,
            });
        }

        for queue in queues {
            retry_if(
                &self.retry,
                "publish_envelope",
                || {
                    let body = body.clone();
                    async move {
                        self.transport
                            .send_raw(queue, body)
                            .await
                            .map_err(PublishError::from)
                    }
                },
                PublishError::is_retryable,
            )
            .await?;

            tracing::debug!(
                event_id = %envelope.id(),
                event_type = %envelope.event_type(),
                queue = %queue,
                "Envelope accepted by transport"
            );
        }

        Ok(Ack {
            event_id: envelope.id(),
            queues: queues.to_vec(),
        })
    }
}
