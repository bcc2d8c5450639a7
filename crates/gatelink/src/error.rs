//! Error types for gatelink.

use std::fmt;

use gatelink_proto::ProtoError;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur in gateway client operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The token provider returned no credential.
    #[error("credential unavailable: token provider returned no credential")]
    CredentialUnavailable,

    /// Socket-level failure: refused connection, reset, unclean close, timeouts.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame or an error event reported by the gateway.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Too many consecutive heartbeats went unacknowledged.
    #[error("heartbeat timeout: {missed} consecutive heartbeats unacknowledged")]
    HeartbeatTimeout {
        /// Number of consecutive missed acknowledgements.
        missed: u32,
    },

    /// Automatic reconnection gave up.
    #[error("maximum reconnection attempts exceeded ({attempts})")]
    MaxAttemptsExceeded {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pending connection attempt was cancelled by a disconnect.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// The client has shut down.
    #[error("gateway client has shut down")]
    ClientClosed,
}

impl GatewayError {
    /// The taxonomy bucket this error falls into.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CredentialUnavailable => ErrorKind::CredentialUnavailable,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::HeartbeatTimeout { .. } => ErrorKind::HeartbeatTimeout,
            Self::MaxAttemptsExceeded { .. } => ErrorKind::MaxAttemptsExceeded,
            Self::Config(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ClientClosed => ErrorKind::ClientClosed,
        }
    }

    /// Whether automatic reconnection applies to this error.
    ///
    /// Transport and heartbeat failures are retried; a missing credential needs the
    /// application to call `connect()` again, and the attempt cap needs `reconnect()`.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::HeartbeatTimeout { .. })
    }
}

impl From<ProtoError> for GatewayError {
    fn from(err: ProtoError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Copyable error classification stored in connection state snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// See [`GatewayError::CredentialUnavailable`].
    CredentialUnavailable,
    /// See [`GatewayError::Transport`].
    Transport,
    /// See [`GatewayError::Protocol`].
    Protocol,
    /// See [`GatewayError::HeartbeatTimeout`].
    HeartbeatTimeout,
    /// See [`GatewayError::MaxAttemptsExceeded`].
    MaxAttemptsExceeded,
    /// See [`GatewayError::Config`].
    Config,
    /// See [`GatewayError::Cancelled`].
    Cancelled,
    /// See [`GatewayError::ClientClosed`].
    ClientClosed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CredentialUnavailable => "CredentialUnavailable",
            Self::Transport => "TransportError",
            Self::Protocol => "ProtocolError",
            Self::HeartbeatTimeout => "HeartbeatTimeout",
            Self::MaxAttemptsExceeded => "MaxAttemptsExceeded",
            Self::Config => "ConfigError",
            Self::Cancelled => "Cancelled",
            Self::ClientClosed => "ClientClosed",
        };
        f.write_str(name)
    }
}
