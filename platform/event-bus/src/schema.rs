//! Payload schemas registered per event type
//!
//! Schemas only list required fields and their types; extra fields are
//! allowed so producers can add fields in a later `schemaVersion` without
//! breaking consumers still on this build.

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::envelope::{EventType, MalformedEventError};

/// Payload keys that must never leave the producing service
const SECRET_FIELDS: [&str; 3] = ["password", "passwordHash", "hashedPassword"];

const ORDER_STATUSES: [&str; 4] = ["PENDING", "PROCESSING", "COMPLETED", "CANCELLED"];

static SCHEMAS: Lazy<HashMap<EventType, (Value, JSONSchema)>> = Lazy::new(|| {
    EventType::KNOWN
        .into_iter()
        .filter_map(|event_type| {
            let raw = raw_schema(&event_type)?;
            let compiled = JSONSchema::compile(&raw).expect("built-in payload schema compiles");
            Some((event_type, (raw, compiled)))
        })
        .collect()
});

fn line_item() -> Value {
    json!({
        "type": "object",
        "required": ["productId", "quantity", "price"],
        "properties": {
            "productId": {"type": "string", "minLength": 1},
            "quantity": {"type": "integer", "minimum": 1},
            "price": {"type": "number", "minimum": 0},
            "name": {"type": "string"}
        }
    })
}

fn raw_schema(event_type: &EventType) -> Option<Value> {
    let id = json!({"type": "string", "minLength": 1});

    let schema = match event_type {
        EventType::UserCreated | EventType::UserUpdated => json!({
            "type": "object",
            "required": ["userId", "email"],
            "properties": {
                "userId": id,
                "email": {"type": "string", "minLength": 3},
                "firstName": {"type": "string"},
                "lastName": {"type": "string"}
            }
        }),
        EventType::CartCreated => json!({
            "type": "object",
            "required": ["cartId", "userId", "total"],
            "properties": {
                "cartId": id,
                "userId": id,
                "items": {"type": "array", "items": line_item()},
                "total": {"type": "number", "minimum": 0}
            }
        }),
        EventType::CartUpdated => json!({
            "type": "object",
            "required": ["cartId", "userId", "items", "total"],
            "properties": {
                "cartId": id,
                "userId": id,
                "items": {"type": "array", "items": line_item()},
                "total": {"type": "number", "minimum": 0}
            }
        }),
        EventType::CartConverted => json!({
            "type": "object",
            "required": ["cartId", "userId"],
            "properties": {
                "cartId": id,
                "userId": id,
                "shippingAddress": {"type": "object"}
            }
        }),
        EventType::OrderCreated => json!({
            "type": "object",
            "required": ["orderId", "userId", "total", "status"],
            "properties": {
                "orderId": id,
                "userId": id,
                "cartId": {"type": "string"},
                "items": {"type": "array", "items": line_item()},
                "total": {"type": "number", "minimum": 0},
                "status": {"enum": ORDER_STATUSES}
            }
        }),
        EventType::OrderUpdated => json!({
            "type": "object",
            "required": ["orderId", "userId", "status"],
            "properties": {
                "orderId": id,
                "userId": id,
                "status": {"enum": ORDER_STATUSES}
            }
        }),
        EventType::OrderCompleted => json!({
            "type": "object",
            "required": ["orderId", "userId"],
            "properties": {
                "orderId": id,
                "userId": id
            }
        }),
        EventType::Other(_) => return None,
    };

    Some(schema)
}

/// Raw JSON schema registered for a type, if any
pub fn schema_for(event_type: &EventType) -> Option<&'static Value> {
    SCHEMAS.get(event_type).map(|(raw, _)| raw)
}

/// Validate a payload against the schema registered for its type
///
/// Types without a registered schema (newer producers) pass.
pub fn validate_payload(
    event_type: &EventType,
    schema_version: u32,
    payload: &Value,
) -> Result<(), MalformedEventError> {
    let Some((_, schema)) = SCHEMAS.get(event_type) else {
        return Ok(());
    };

    if let Err(errors) = schema.validate(payload) {
        let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(MalformedEventError::SchemaViolation {
            event_type: event_type.to_string(),
            schema_version,
            reason: reasons.join("; "),
        });
    }

    Ok(())
}

/// Find the first secret-looking key anywhere in a payload
pub fn find_secret_field(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.iter().find_map(|(key, nested)| {
            if SECRET_FIELDS.contains(&key.as_str()) {
                Some(key.clone())
            } else {
                find_secret_field(nested)
            }
        }),
        Value::Array(items) => items.iter().find_map(find_secret_field),
        _ => None,
    }
}
