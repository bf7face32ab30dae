//! Payload parsing and provider-declared shape checks.

use serde_json::{Map, Value as JsonValue};

use crate::headers::RequestHeaders;
use crate::providers::ProviderConfig;

/// Payload key used to classify an event when no event-type header is present
pub const EVENT_TYPE_FIELD: &str = "type";

/// Errors raised while parsing or validating a webhook payload
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid JSON payload")]
    Malformed(#[source] serde_json::Error),

    #[error("Missing required fields: {}", .fields.join(", "))]
    MissingFields { fields: Vec<String> },
}

/// Parse a raw body as JSON. An empty body is an empty object.
pub fn parse_body(raw: &[u8]) -> Result<JsonValue, PayloadError> {
    if raw.is_empty() {
        return Ok(JsonValue::Object(Map::new()));
    }
    serde_json::from_slice(raw).map_err(PayloadError::Malformed)
}

/// Required top-level keys absent from `payload`, in declaration order.
///
/// Only objects carry keys, so every required field is missing from any
/// other JSON value.
pub fn missing_fields(required: &[String], payload: &JsonValue) -> Vec<String> {
    let object = payload.as_object();
    required
        .iter()
        .filter(|field| !object.is_some_and(|map| map.contains_key(field.as_str())))
        .cloned()
        .collect()
}

/// Enforce the provider's required fields (shallow check)
pub fn validate_required_fields(
    provider: &ProviderConfig,
    payload: &JsonValue,
) -> Result<(), PayloadError> {
    let fields = missing_fields(&provider.required_fields, payload);
    if fields.is_empty() {
        Ok(())
    } else {
        Err(PayloadError::MissingFields { fields })
    }
}

/// Classify an event: the provider's event-type header first, then the
/// payload's `type` field, else empty.
pub fn classify_event_type(
    provider: &ProviderConfig,
    headers: &RequestHeaders,
    payload: &JsonValue,
) -> String {
    let from_header = provider
        .event_type_header
        .as_deref()
        .and_then(|name| headers.get(name))
        .filter(|value| !value.is_empty());
    if let Some(event_type) = from_header {
        return event_type.to_string();
    }

    match payload.get(EVENT_TYPE_FIELD) {
        Some(JsonValue::String(event_type)) => event_type.clone(),
        Some(value @ (JsonValue::Number(_) | JsonValue::Bool(_))) => value.to_string(),
        _ => String::new(),
    }
}
