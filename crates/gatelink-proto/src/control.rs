//! Reserved control events.
//!
//! These event types drive the connection itself (session assignment, liveness,
//! server-side errors) and are consumed by the client instead of being routed to
//! application handlers.

use serde_json::{json, Value};

use crate::Frame;

/// Sent by the gateway once the session is assigned.
pub const CONNECTION_ESTABLISHED: &str = "connection_established";
/// Heartbeat probe. Outbound it carries the client timestamp and missed count.
pub const HEARTBEAT: &str = "heartbeat";
/// Heartbeat acknowledgement.
pub const HEARTBEAT_ACK: &str = "heartbeat_ack";
/// Alternate name for a heartbeat acknowledgement.
pub const PONG: &str = "pong";
/// Server-reported error.
pub const ERROR: &str = "error";

/// Kind of reserved control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    /// Session established; carries identifiers.
    ConnectionEstablished,
    /// Heartbeat acknowledgement (PONG).
    HeartbeatAck,
    /// Generic heartbeat probe from the gateway.
    Heartbeat,
    /// Error reported by the gateway.
    Error,
}

impl ControlKind {
    /// Classify an event type, returning `None` for application events.
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            CONNECTION_ESTABLISHED => Some(Self::ConnectionEstablished),
            HEARTBEAT_ACK | PONG => Some(Self::HeartbeatAck),
            HEARTBEAT => Some(Self::Heartbeat),
            ERROR => Some(Self::Error),
            _ => None,
        }
    }

    /// Canonical wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionEstablished => CONNECTION_ESTABLISHED,
            Self::HeartbeatAck => HEARTBEAT_ACK,
            Self::Heartbeat => HEARTBEAT,
            Self::Error => ERROR,
        }
    }
}

/// Whether an event type is reserved for connection control.
#[must_use]
pub fn is_reserved(event_type: &str) -> bool {
    ControlKind::from_event_type(event_type).is_some()
}

/// A parsed control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// The gateway assigned identifiers to this connection.
    ConnectionEstablished {
        /// Connection identifier.
        connection_id: Option<String>,
        /// Session identifier, when the gateway issues one.
        session_id: Option<String>,
    },
    /// Heartbeat acknowledgement.
    HeartbeatAck {
        /// Server time in milliseconds since the Unix epoch.
        server_timestamp: Option<i64>,
    },
    /// Heartbeat probe from the gateway.
    Heartbeat,
    /// Error reported by the gateway.
    Error {
        /// Human-readable message.
        message: String,
    },
}

impl ControlMessage {
    /// Parse a control event from a frame; `None` for application events.
    ///
    /// Payload fields are read leniently: both `snake_case` and `camelCase` keys
    /// are accepted and identifiers may be strings or numbers.
    #[must_use]
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let kind = ControlKind::from_event_type(&frame.event_type)?;
        let payload = &frame.payload;

        Some(match kind {
            ControlKind::ConnectionEstablished => Self::ConnectionEstablished {
                connection_id: identifier(payload, &["connection_id", "connectionId"]),
                session_id: identifier(payload, &["session_id", "sessionId"]),
            },
            ControlKind::HeartbeatAck => Self::HeartbeatAck {
                server_timestamp: payload
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .or(frame.server_timestamp),
            },
            ControlKind::Heartbeat => Self::Heartbeat,
            ControlKind::Error => Self::Error {
                message: match payload {
                    Value::String(s) => s.clone(),
                    Value::Null => "unspecified gateway error".to_string(),
                    other => other
                        .get("message")
                        .and_then(Value::as_str)
                        .map_or_else(|| other.to_string(), str::to_string),
                },
            },
        })
    }
}

fn identifier(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Payload for an outbound heartbeat probe.
#[must_use]
pub fn heartbeat_payload(client_timestamp_ms: i64, missed: u32) -> Value {
    json!({
        "timestamp": client_timestamp_ms,
        "missed": missed,
    })
}

/// Payload for acknowledging a heartbeat probe from the gateway.
#[must_use]
pub fn heartbeat_ack_payload(client_timestamp_ms: i64) -> Value {
    json!({ "timestamp": client_timestamp_ms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("connection_established", Some(ControlKind::ConnectionEstablished) ; "established")]
    #[test_case("heartbeat_ack", Some(ControlKind::HeartbeatAck) ; "ack")]
    #[test_case("pong", Some(ControlKind::HeartbeatAck) ; "pong alias")]
    #[test_case("heartbeat", Some(ControlKind::Heartbeat) ; "heartbeat")]
    #[test_case("error", Some(ControlKind::Error) ; "error")]
    #[test_case("message_create", None ; "application event")]
    #[test_case("Error", None ; "case sensitive")]
    fn test_classify_event_type(event_type: &str, expected: Option<ControlKind>) {
        assert_eq!(ControlKind::from_event_type(event_type), expected);
        assert_eq!(is_reserved(event_type), expected.is_some());
    }

    #[test]
    fn test_connection_established_ids() {
        let frame = Frame::new(
            CONNECTION_ESTABLISHED,
            json!({"connectionId": "c-42", "session_id": 9001}),
        );
        assert_eq!(
            ControlMessage::from_frame(&frame),
            Some(ControlMessage::ConnectionEstablished {
                connection_id: Some("c-42".to_string()),
                session_id: Some("9001".to_string()),
            })
        );
    }

    #[test]
    fn test_heartbeat_ack_prefers_payload_timestamp() {
        let frame = Frame::new(PONG, json!({"timestamp": 5})).with_server_timestamp(7);
        assert_eq!(
            ControlMessage::from_frame(&frame),
            Some(ControlMessage::HeartbeatAck {
                server_timestamp: Some(5)
            })
        );

        let frame = Frame::new(HEARTBEAT_ACK, Value::Null).with_server_timestamp(7);
        assert_eq!(
            ControlMessage::from_frame(&frame),
            Some(ControlMessage::HeartbeatAck {
                server_timestamp: Some(7)
            })
        );
    }

    #[test]
    fn test_error_message_shapes() {
        let cases = [
            (json!("rate limited"), "rate limited"),
            (json!({"message": "bad token"}), "bad token"),
            (Value::Null, "unspecified gateway error"),
        ];
        for (payload, expected) in cases {
            let frame = Frame::new(ERROR, payload);
            assert_eq!(
                ControlMessage::from_frame(&frame),
                Some(ControlMessage::Error {
                    message: expected.to_string()
                })
            );
        }
    }

    #[test]
    fn test_application_event_is_not_control() {
        let frame = Frame::new("message_create", json!({"text": "hi"}));
        assert_eq!(ControlMessage::from_frame(&frame), None);
    }

    #[test]
    fn test_heartbeat_payload_shape() {
        let payload = heartbeat_payload(1234, 2);
        assert_eq!(payload["timestamp"], 1234);
        assert_eq!(payload["missed"], 2);
    }
}
