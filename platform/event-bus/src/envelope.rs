//! # Event Envelope
//!
//! Wire contract for every domain event exchanged between the user, cart and
//! order services.
//!
//! ## Design Principles
//!
//! 1. **Stable wire format**: field names and enumeration spellings are fixed,
//!    field order is irrelevant
//! 2. **Validation**: an envelope cannot be constructed or decoded without
//!    passing the payload schema registered for its type
//! 3. **Versioning**: `schemaVersion` allows additive payload evolution
//! 4. **Forward compatibility**: unknown event types survive a decode/encode
//!    cycle untouched so older consumers can skip them
//!
//! ## Envelope Fields
//!
//! - `id`: Unique identifier, the deduplication key for every consumer
//! - `type`: Event type tag (`USER_CREATED`, `CART_CREATED`, ...)
//! - `source`: Producing service
//! - `occurredAt`: ISO 8601 timestamp assigned by the producer
//! - `schemaVersion`: Payload schema version
//! - `payload`: Event-specific data, never containing secrets

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::schema;

/// Schema version stamped on envelopes built by this crate
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Domain event type tag
///
/// Unknown tags decode into [`EventType::Other`] and encode back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    UserCreated,
    UserUpdated,
    CartCreated,
    CartUpdated,
    CartConverted,
    OrderCreated,
    OrderUpdated,
    OrderCompleted,
    /// A tag this build does not know about (newer producer)
    Other(String),
}

impl EventType {
    /// Every type this build can produce
    pub const KNOWN: [EventType; 8] = [
        EventType::UserCreated,
        EventType::UserUpdated,
        EventType::CartCreated,
        EventType::CartUpdated,
        EventType::CartConverted,
        EventType::OrderCreated,
        EventType::OrderUpdated,
        EventType::OrderCompleted,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventType::UserCreated => "USER_CREATED",
            EventType::UserUpdated => "USER_UPDATED",
            EventType::CartCreated => "CART_CREATED",
            EventType::CartUpdated => "CART_UPDATED",
            EventType::CartConverted => "CART_CONVERTED",
            EventType::OrderCreated => "ORDER_CREATED",
            EventType::OrderUpdated => "ORDER_UPDATED",
            EventType::OrderCompleted => "ORDER_COMPLETED",
            EventType::Other(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Other(_))
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "USER_CREATED" => EventType::UserCreated,
            "USER_UPDATED" => EventType::UserUpdated,
            "CART_CREATED" => EventType::CartCreated,
            "CART_UPDATED" => EventType::CartUpdated,
            "CART_CONVERTED" => EventType::CartConverted,
            "ORDER_CREATED" => EventType::OrderCreated,
            "ORDER_UPDATED" => EventType::OrderUpdated,
            "ORDER_COMPLETED" => EventType::OrderCompleted,
            _ => EventType::Other(tag),
        }
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceService {
    UserService,
    CartService,
    OrderService,
}

impl SourceService {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceService::UserService => "USER_SERVICE",
            SourceService::CartService => "CART_SERVICE",
            SourceService::OrderService => "ORDER_SERVICE",
        }
    }
}

impl fmt::Display for SourceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an envelope cannot be built or decoded. Never retryable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedEventError {
    #[error("missing or invalid envelope field: {0}")]
    MissingField(&'static str),

    #[error("failed to decode envelope: {0}")]
    Decode(String),

    #[error("unsupported schema version {0}")]
    InvalidSchemaVersion(u32),

    #[error("payload for {event_type} must be a JSON object")]
    PayloadNotObject { event_type: String },

    #[error("payload for {event_type} violates schema v{schema_version}: {reason}")]
    SchemaViolation {
        event_type: String,
        schema_version: u32,
        reason: String,
    },

    #[error("payload for {event_type} carries secret field `{field}`")]
    SecretInPayload { event_type: String, field: String },
}

/// Immutable domain event envelope
///
/// Fields are private: once built, an envelope is only ever read, so a
/// consumer reacting to it has to build a new envelope with a new id.
///
/// # Examples
///
/// ```rust
/// use event_bus::{EventEnvelope, EventType, SourceService};
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(
///     EventType::CartCreated,
///     SourceService::CartService,
///     json!({ "cartId": "c1", "userId": "u1", "total": 42.5 }),
/// )
/// .expect("valid cart payload");
///
/// assert_eq!(envelope.event_type(), &EventType::CartCreated);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: EventType,
    source: SourceService,
    occurred_at: DateTime<Utc>,
    schema_version: u32,
    payload: Value,
}

impl EventEnvelope {
    /// Build an envelope with a freshly generated id
    pub fn new(
        event_type: EventType,
        source: SourceService,
        payload: Value,
    ) -> Result<Self, MalformedEventError> {
        Self::with_id(Uuid::new_v4(), event_type, source, payload)
    }

    /// Build an envelope with a caller-chosen id
    ///
    /// Used when the id must be derived deterministically, e.g. from the
    /// event that triggered this one, so a re-run produces the same id.
    pub fn with_id(
        id: Uuid,
        event_type: EventType,
        source: SourceService,
        payload: Value,
    ) -> Result<Self, MalformedEventError> {
        let envelope = Self {
            id,
            event_type,
            source,
            occurred_at: Utc::now(),
            schema_version: CURRENT_SCHEMA_VERSION,
            payload,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Override the producer timestamp
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Decode and validate wire bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MalformedEventError> {
        let raw: Value = serde_json::from_slice(bytes)
            .map_err(|e| MalformedEventError::Decode(e.to_string()))?;

        validate_envelope_fields(&raw)?;

        let envelope: Self = serde_json::from_value(raw)
            .map_err(|e| MalformedEventError::Decode(e.to_string()))?;
        envelope.validate()?;

        Ok(envelope)
    }

    /// Encode to wire bytes
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Run every construction-time check against this envelope
    pub fn validate(&self) -> Result<(), MalformedEventError> {
        if self.id.is_nil() {
            return Err(MalformedEventError::MissingField("id"));
        }

        if self.event_type.as_str().trim().is_empty() {
            return Err(MalformedEventError::MissingField("type"));
        }

        if self.schema_version == 0 {
            return Err(MalformedEventError::InvalidSchemaVersion(0));
        }

        if !self.payload.is_object() {
            return Err(MalformedEventError::PayloadNotObject {
                event_type: self.event_type.to_string(),
            });
        }

        if let Some(field) = schema::find_secret_field(&self.payload) {
            return Err(MalformedEventError::SecretInPayload {
                event_type: self.event_type.to_string(),
                field,
            });
        }

        schema::validate_payload(&self.event_type, self.schema_version, &self.payload)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn source(&self) -> SourceService {
        self.source
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deserialize the payload into a typed contract
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, MalformedEventError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            MalformedEventError::SchemaViolation {
                event_type: self.event_type.to_string(),
                schema_version: self.schema_version,
                reason: e.to_string(),
            }
        })
    }
}

/// Validate the raw envelope shape before typed decoding
///
/// # Validation Rules
///
/// - `id`: Must be a valid UUID string
/// - `type`: Must be a non-empty string
/// - `source`: Must be a non-empty string
/// - `occurredAt`: Must be an RFC 3339 timestamp
/// - `schemaVersion`: Must be a positive integer
/// - `payload`: Must be present
pub fn validate_envelope_fields(envelope: &Value) -> Result<(), MalformedEventError> {
    let id = envelope
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or(MalformedEventError::MissingField("id"))?;

    Uuid::parse_str(id).map_err(|_| MalformedEventError::MissingField("id"))?;

    let event_type = envelope
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(MalformedEventError::MissingField("type"))?;

    if event_type.trim().is_empty() {
        return Err(MalformedEventError::MissingField("type"));
    }

    let source = envelope
        .get("source")
        .and_then(|v| v.as_str())
        .ok_or(MalformedEventError::MissingField("source"))?;

    if source.trim().is_empty() {
        return Err(MalformedEventError::MissingField("source"));
    }

    let occurred_at = envelope
        .get("occurredAt")
        .and_then(|v| v.as_str())
        .ok_or(MalformedEventError::MissingField("occurredAt"))?;

    DateTime::parse_from_rfc3339(occurred_at)
        .map_err(|_| MalformedEventError::MissingField("occurredAt"))?;

    envelope
        .get("schemaVersion")
        .and_then(|v| v.as_u64())
        .filter(|v| *v > 0)
        .ok_or(MalformedEventError::MissingField("schemaVersion"))?;

    envelope
        .get("payload")
        .ok_or(MalformedEventError::MissingField("payload"))?;

    Ok(())
}
