//! Payload sanitizing and normalization.
//!
//! Turns a raw bus envelope into a [`MessageDraft`]: parses the payload as
//! JSON (falling back to wrapping the raw bytes rather than discarding the
//! message), scrubs every string against a conservative allow-list, and
//! extracts the indexed derived fields. Extraction is a pure function of the
//! payload, so repeated writes of the same bytes always derive the same
//! fields.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::storage::MessageDraft;

/// Field under which an unparsable payload is preserved.
pub const FALLBACK_FIELD: &str = "raw";

/// Payload field holding the event time, RFC 3339.
const TIMESTAMP_FIELD: &str = "timestamp";

/// Payload field holding the machine identifier.
const MACHINE_ID_FIELD: &str = "machine_id";

/// Payload field holding the machine status.
const STATUS_FIELD: &str = "status";

/// Punctuation allowed through the scrubber, besides ASCII alphanumerics and space.
const ALLOWED_PUNCT: &str = ".,;:!?_-+/=@#%&*()[]";

/// Replacement for characters outside the allow-list. Must itself be in the
/// allow-list so sanitizing is idempotent.
const PLACEHOLDER: char = '_';

/// A message as delivered by the bus, before any processing.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    /// Bus topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Delivery-quality hint from the bus.
    pub qos: u8,
    /// Wall-clock receipt time, the event-time fallback.
    pub receipt_time: DateTime<Utc>,
}

/// Sanitize and normalize an envelope into a draft record.
///
/// Never fails: unparsable payloads survive under [`FALLBACK_FIELD`], and a
/// missing or unparsable event time falls back to the receipt time.
pub fn normalize(envelope: RawEnvelope) -> MessageDraft {
    let parsed = match serde_json::from_slice::<Value>(&envelope.payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, topic = %envelope.topic,
                "Payload is not valid JSON, wrapping raw bytes");
            let raw = String::from_utf8_lossy(&envelope.payload).into_owned();
            Value::Object(
                [(FALLBACK_FIELD.to_string(), Value::String(raw))]
                    .into_iter()
                    .collect(),
            )
        }
    };

    let payload = sanitize_value(parsed);
    let machine_id = extract_field(&payload, MACHINE_ID_FIELD);
    let status = extract_field(&payload, STATUS_FIELD);
    let timestamp = extract_timestamp(&payload).unwrap_or(envelope.receipt_time);

    MessageDraft {
        timestamp,
        topic: envelope.topic,
        payload,
        qos: envelope.qos,
        machine_id,
        status,
    }
}

/// Replace every character outside the allow-list with the placeholder.
pub fn sanitize_str(input: &str) -> String {
    input
        .chars()
        .map(|c| if is_allowed(c) { c } else { PLACEHOLDER })
        .collect()
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || ALLOWED_PUNCT.contains(c)
}

/// Recursively scrub all strings in a document, keys included.
fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (sanitize_str(&k), sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Shallow extraction of a top-level string field. Absence is not an error.
fn extract_field(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_timestamp(payload: &Value) -> Option<DateTime<Utc>> {
    payload
        .get(TIMESTAMP_FIELD)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
