//! # Commerce Event Bus
//!
//! The event propagation core shared by the user, cart and order services.
//!
//! ## Pieces
//!
//! - **EventEnvelope**: versioned wire format of a domain event
//! - **QueueTransport**: at-least-once queue with visibility timeouts
//!   (`InMemoryQueue` for dev/test, `JetStreamQueue` for production)
//! - **Publisher**: routes an envelope to the queues of its consumer groups
//! - **OutboxCoordinator**: stages an event atomically with the business write
//!   and sweeps pending events to the publisher
//! - **ConsumerLoop**: receives, deduplicates, dispatches and acknowledges
//! - **IdempotencyGuard** / **DeadLetterSink**: consumer-side stores
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{InMemoryQueue, Publisher, QueueRoutes, QueueTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Production: NATS JetStream
//! let nats_client = async_nats::connect("nats://localhost:4222").await?;
//! let transport: Arc<dyn QueueTransport> =
//!     Arc::new(event_bus::JetStreamQueue::connect(nats_client).await?);
//!
//! // Dev/Test: In-Memory
//! let transport: Arc<dyn QueueTransport> = Arc::new(InMemoryQueue::new());
//!
//! let publisher = Publisher::new(transport, QueueRoutes::commerce());
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod dlq;
mod envelope;
pub mod idempotency;
mod inmemory_bus;
mod nats_bus;
pub mod outbox;
pub mod publisher;
pub mod retry;
pub mod schema;
pub mod store;

pub use consumer::{
    ConsumerConfig, ConsumerHandle, ConsumerLoop, ConsumerState, EventHandler, HandlerError,
    HandlerRegistry, ProcessOutcome,
};
pub use dlq::{DeadLetter, DeadLetterReason, DeadLetterSink};
pub use envelope::{
    validate_envelope_fields, EventEnvelope, EventType, MalformedEventError, SourceService,
    CURRENT_SCHEMA_VERSION,
};
pub use idempotency::{ClaimOutcome, IdempotencyGuard, ProcessedPurger};
pub use inmemory_bus::InMemoryQueue;
pub use nats_bus::JetStreamQueue;
pub use outbox::{
    Mutation, OutboxConfig, OutboxCoordinator, OutboxRecord, OutboxStatus, OutboxStore,
    StageError, Staged, SweepReport,
};
pub use publisher::{Ack, PublishError, Publisher, QueueRoutes};
pub use store::{EntityStore, MemoryStore, PgStore, StoreError, Stores};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Opaque token identifying one delivery attempt of a message
///
/// Two deliveries of the same envelope carry different receipt handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message received from a queue
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// The logical queue this delivery came from
    pub queue: String,
    /// Raw envelope bytes, decoded lazily so malformed bodies can be dead-lettered
    pub body: Vec<u8>,
    /// Token for acknowledging or extending this particular delivery
    pub receipt: ReceiptHandle,
    /// How many times this message has been delivered, including this one
    pub delivery_count: u32,
}

impl QueueMessage {
    /// Decode the body into a validated envelope
    pub fn envelope(&self) -> Result<EventEnvelope, MalformedEventError> {
        EventEnvelope::from_slice(&self.body)
    }
}

/// Errors that can occur when talking to a queue transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("send throttled: {0}")]
    Throttled(String),

    #[error("message of {size} bytes exceeds transport limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("failed to receive from queue: {0}")]
    ReceiveError(String),

    #[error("unknown or expired receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl BusError {
    /// Whether retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Unavailable(_)
                | BusError::Throttled(_)
                | BusError::ReceiveError(_)
                | BusError::ConnectionError(_)
        )
    }
}

/// Result type for queue transport operations
pub type BusResult<T> = Result<T, BusError>;

/// At-least-once queue transport
///
/// A received message stays hidden from other receivers for its visibility
/// timeout and reappears if it is not acknowledged in time. Acknowledging is
/// the only way to remove a message. Ordering is best-effort only.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Send an already-encoded message body to a logical queue
    async fn send_raw(&self, queue: &str, body: Vec<u8>) -> BusResult<()>;

    /// Receive up to `max_messages`, waiting a bounded time when the queue is empty
    ///
    /// Every returned message is hidden for `visibility_timeout`.
    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> BusResult<Vec<QueueMessage>>;

    /// Permanently remove the delivered message
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> BusResult<()>;

    /// Keep an in-flight message hidden for another `duration`
    async fn extend_visibility(&self, receipt: &ReceiptHandle, duration: Duration)
        -> BusResult<()>;

    /// Encode and send an envelope to a logical queue
    async fn send(&self, queue: &str, envelope: &EventEnvelope) -> BusResult<()> {
        let body = envelope
            .to_vec()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;
        self.send_raw(queue, body).await
    }
}

impl fmt::Debug for dyn QueueTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueTransport")
    }
}
