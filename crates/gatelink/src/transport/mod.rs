//! Transport seam.
//!
//! The driver talks to the gateway through a [`Transport`]: a sink of outbound
//! frames and a stream of inbound frames, produced by a [`Connector`]. The
//! WebSocket connector is used in production; the in-memory connector drives the
//! same state machine in tests without sockets.

use std::pin::Pin;

use futures::future::BoxFuture;
use futures::{Sink, Stream};
use url::Url;

use crate::error::GatewayError;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryGateway, MemoryPeer};
pub use websocket::TungsteniteConnector;

/// Close code for an orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// A frame written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Encoded event.
    Binary(Vec<u8>),
    /// Orderly close.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

impl OutboundFrame {
    /// Normal-closure close frame.
    #[must_use]
    pub fn normal_close(reason: impl Into<String>) -> Self {
        Self::Close {
            code: NORMAL_CLOSURE,
            reason: reason.into(),
        }
    }
}

/// A frame read from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Encoded event.
    Binary(Vec<u8>),
    /// Text message; the gateway speaks binary only, so this is a protocol error.
    Text(String),
    /// The gateway closed the connection, with an optional reason.
    Close(Option<String>),
    /// Transport-level keepalive (WebSocket ping/pong). Counts as liveness only.
    Keepalive,
}

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<OutboundFrame, Error = GatewayError> + Send>>;

/// Inbound half of a transport. The stream ends when the connection drops.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<InboundFrame, GatewayError>> + Send>>;

/// An open connection to the gateway.
pub struct Transport {
    /// Outbound frames.
    pub sink: FrameSink,
    /// Inbound frames.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports to the gateway.
pub trait Connector: Send + Sync + 'static {
    /// Perform the handshake against `url`, which already carries the credential.
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, GatewayError>>;
}
