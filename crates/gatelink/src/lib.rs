//! # gatelink
//!
//! Resilient client for a real-time message gateway.
//!
//! A [`GatewayClient`] keeps one persistent connection to the gateway:
//!
//! - fetches a short-lived credential from a [`TokenProvider`] before every attempt
//!   and passes it in the handshake URL
//! - probes liveness with heartbeats and replaces connections that stop answering
//! - reconnects with exponential backoff and jitter, up to an attempt cap
//! - queues sends while disconnected and flushes them in order on the next open
//! - routes inbound events to handlers registered per event type
//! - scores connection quality and reconnects proactively when it turns critical
//!
//! ## Example
//!
//! ```rust,no_run
//! use gatelink::{ClientConfig, GatewayClient, StaticToken};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), gatelink::GatewayError> {
//! let config = ClientConfig::new("wss://gateway.example.com/ws");
//! let client = GatewayClient::spawn(config, StaticToken::new("secret"))?;
//!
//! client.on("message_create", |frame| {
//!     println!("{}", frame.payload);
//!     Ok(())
//! });
//!
//! client.connect().await?;
//! client.send_message("message_create", &json!({"text": "hello"})).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
mod driver;
pub mod error;
pub mod heartbeat;
pub mod quality;
pub mod queue;
pub mod reconnect;
pub mod router;
pub mod state;
pub mod token;
pub mod transport;

pub use client::GatewayClient;
pub use config::ClientConfig;
pub use driver::SendOutcome;
pub use error::{ErrorKind, GatewayError};
pub use gatelink_proto::Frame;
pub use quality::{QualityLevel, QualityScore};
pub use router::{HandlerId, HandlerResult};
pub use state::{ConnectionMetrics, ConnectionPhase, ConnectionState, LastError, StateSubscription};
pub use token::{StaticToken, TokenProvider};
