//! Dead-letter handling
//!
//! Messages that can never be processed are parked in a dead-letter sink
//! together with the failure reason, then acknowledged so they stop
//! blocking the queue. Writing the dead letter is also the operator alert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::store::StoreError;
use crate::QueueMessage;

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    /// The body could not be decoded or failed validation
    Malformed,
    /// The handler reported a permanent failure
    Fatal,
    /// The handler kept failing until the delivery limit was reached
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Malformed => "MALFORMED",
            DeadLetterReason::Fatal => "FATAL",
            DeadLetterReason::RetriesExhausted => "RETRIES_EXHAUSTED",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that was given up on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub consumer_id: String,
    pub queue: String,
    pub event_id: Option<Uuid>,
    pub event_type: Option<String>,
    /// The envelope as JSON, or the raw body as a string when it is not JSON
    pub body: Value,
    pub reason: DeadLetterReason,
    pub error: String,
    pub delivery_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Build a dead letter from a delivery, salvaging whatever metadata the body has
    pub fn from_message(
        consumer_id: &str,
        message: &QueueMessage,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        let body = serde_json::from_slice::<Value>(&message.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&message.body).into_owned()));

        let event_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        let event_type = body
            .get("type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Self {
            consumer_id: consumer_id.to_string(),
            queue: message.queue.clone(),
            event_id,
            event_type,
            body,
            reason,
            error: error.into(),
            delivery_count: message.delivery_count,
            failed_at: Utc::now(),
        }
    }
}

/// Durable parking place for dead letters
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persist a dead letter. The message must not be acknowledged unless this succeeds.
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError>;
}

/// Write a dead letter and raise the operator alert
pub async fn park(sink: &dyn DeadLetterSink, letter: DeadLetter) -> Result<(), StoreError> {
    let event_id = letter
        .event_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let consumer_id = letter.consumer_id.clone();
    let reason = letter.reason;
    let delivery_count = letter.delivery_count;
    let error = letter.error.clone();

    match sink.dead_letter(letter).await {
        Ok(()) => {
            tracing::error!(
                event_id = %event_id,
                consumer_id = %consumer_id,
                reason = %reason,
                delivery_count = delivery_count,
                error = %error,
                "Event moved to dead-letter sink"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                event_id = %event_id,
                consumer_id = %consumer_id,
                reason = %reason,
                delivery_count = delivery_count,
                error = %error,
                dlq_error = %e,
                "Failed to write dead letter, message left on queue"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReceiptHandle;
    use serde_json::json;

    fn message(body: &[u8]) -> QueueMessage {
        QueueMessage {
            queue: "order-service".to_string(),
            body: body.to_vec(),
            receipt: ReceiptHandle::new("r-1"),
            delivery_count: 4,
        }
    }

    #[test]
    fn test_dead_letter_salvages_metadata() {
        let id = Uuid::new_v4();
        let body = serde_json::to_vec(&json!({"id": id, "type": "CART_CREATED"})).unwrap();

        let letter = DeadLetter::from_message(
            "order-consumer",
            &message(&body),
            DeadLetterReason::Malformed,
            "missing payload",
        );

        assert_eq!(letter.event_id, Some(id));
        assert_eq!(letter.event_type.as_deref(), Some("CART_CREATED"));
        assert_eq!(letter.queue, "order-service");
        assert_eq!(letter.delivery_count, 4);
    }

    #[test]
    fn test_dead_letter_keeps_non_json_body() {
        let letter = DeadLetter::from_message(
            "order-consumer",
            &message(b"garbage"),
            DeadLetterReason::Malformed,
            "not json",
        );

        assert_eq!(letter.body, Value::String("garbage".to_string()));
        assert!(letter.event_id.is_none());
    }

    #[test]
    fn test_reason_wire_names() {
        assert_eq!(
            serde_json::to_value(DeadLetterReason::RetriesExhausted).unwrap(),
            json!("RETRIES_EXHAUSTED")
        );
        assert_eq!(DeadLetterReason::Fatal.to_string(), "FATAL");
    }
}
