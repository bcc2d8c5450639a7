//! Binary framing codec.
//!
//! Frames are positional MessagePack arrays rather than maps, which keeps them
//! compact: the event type is not repeated as a field name and the optional
//! server timestamp costs nothing when absent.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Number, Value};

use crate::ProtoError;

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Event type, e.g. `message_create` or one of the reserved control types.
    pub event_type: String,
    /// Arbitrary payload.
    pub payload: Value,
    /// Milliseconds since the Unix epoch as stamped by the gateway, if present.
    pub server_timestamp: Option<i64>,
}

impl Frame {
    /// Create a frame without a server timestamp.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            server_timestamp: None,
        }
    }

    /// Attach a server timestamp.
    #[must_use]
    pub fn with_server_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.server_timestamp = Some(timestamp_ms);
        self
    }

    /// Encode as a 2-element array, or a 3-element array when a timestamp is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        match self.server_timestamp {
            Some(timestamp) => rmp_serde::to_vec(&(&self.event_type, &self.payload, timestamp))
                .map_err(|e| ProtoError::Encoding(e.to_string())),
            None => encode(&self.event_type, &self.payload),
        }
    }
}

/// Encode an outbound `(event_type, payload)` pair.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode(event_type: &str, payload: &Value) -> Result<Vec<u8>, ProtoError> {
    rmp_serde::to_vec(&(event_type, payload)).map_err(|e| ProtoError::Encoding(e.to_string()))
}

/// Decode an inbound frame.
///
/// Accepts `[event_type, payload]` and `[event_type, payload, server_timestamp]`.
/// A `nil` timestamp is treated as absent; a floating point timestamp is truncated
/// to whole milliseconds. MessagePack values with no JSON counterpart are mapped
/// as described in [`to_json`].
///
/// # Errors
///
/// Returns [`ProtoError::Decoding`] for bytes that are not MessagePack and
/// [`ProtoError::InvalidFrame`] for anything that is not a frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtoError> {
    if bytes.is_empty() {
        return Err(ProtoError::InvalidFrame("empty frame".to_string()));
    }

    let mut reader = bytes;
    let value =
        rmpv::decode::read_value(&mut reader).map_err(|e| ProtoError::Decoding(e.to_string()))?;

    let rmpv::Value::Array(elements) = value else {
        return Err(ProtoError::InvalidFrame(format!(
            "frame must be an array, got {value}"
        )));
    };

    let len = elements.len();
    if !(2..=3).contains(&len) {
        return Err(ProtoError::InvalidFrame(format!(
            "expected 2 or 3 elements, got {len}"
        )));
    }

    let mut elements = elements.into_iter();
    let (Some(event_type), Some(payload)) = (elements.next(), elements.next()) else {
        return Err(ProtoError::InvalidFrame("truncated frame".to_string()));
    };

    let event_type = match event_type.as_str() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            return Err(ProtoError::InvalidFrame(format!(
                "event type must be a non-empty string, got {event_type}"
            )));
        }
    };

    let server_timestamp = match elements.next() {
        None | Some(rmpv::Value::Nil) => None,
        Some(rmpv::Value::Integer(n)) => Some(
            n.as_i64()
                .ok_or_else(|| ProtoError::InvalidFrame(format!("timestamp out of range: {n}")))?,
        ),
        Some(rmpv::Value::F32(f)) if f.is_finite() => Some(f as i64),
        Some(rmpv::Value::F64(f)) if f.is_finite() => Some(f as i64),
        Some(other) => {
            return Err(ProtoError::InvalidFrame(format!(
                "timestamp must be a number, got {other}"
            )));
        }
    };

    Ok(Frame {
        event_type,
        payload: to_json(payload),
        server_timestamp,
    })
}

/// Convert a MessagePack value to JSON.
///
/// - `bin` becomes a standard base64 string.
/// - `ext` becomes `{"type": <i8>, "data": <base64>}`.
/// - Non-finite floats become `null`.
/// - Strings that are not valid UTF-8 are decoded lossily.
/// - Non-string map keys use their MessagePack text form.
#[must_use]
pub fn to_json(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(n) => n
            .as_i64()
            .map(Value::from)
            .or_else(|| n.as_u64().map(Value::from))
            .unwrap_or(Value::Null),
        rmpv::Value::F32(f) => Number::from_f64(f64::from(f)).map_or(Value::Null, Value::Number),
        rmpv::Value::F64(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        rmpv::Value::String(s) => Value::String(utf8_lossy(s)),
        rmpv::Value::Binary(bytes) => Value::String(BASE64.encode(bytes)),
        rmpv::Value::Array(items) => Value::Array(items.into_iter().map(to_json).collect()),
        rmpv::Value::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(key, value)| {
                    let key = match key {
                        rmpv::Value::String(s) => utf8_lossy(s),
                        other => other.to_string(),
                    };
                    (key, to_json(value))
                })
                .collect(),
        ),
        rmpv::Value::Ext(kind, data) => json!({ "type": kind, "data": BASE64.encode(data) }),
    }
}

fn utf8_lossy(s: rmpv::Utf8String) -> String {
    String::from_utf8_lossy(s.as_bytes()).into_owned()
}
