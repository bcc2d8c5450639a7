//! # gatelink-proto
//!
//! Wire format for gatelink gateway communication.
//!
//! Every frame exchanged with the gateway is a MessagePack array:
//! `[event_type, payload]` from the client and
//! `[event_type, payload]` or `[event_type, payload, server_timestamp]` from the gateway.
//! A handful of event types are reserved for connection control and never reach
//! application handlers (see [`control`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod control;
pub mod error;

pub use codec::{decode, encode, Frame};
pub use control::{ControlKind, ControlMessage};
pub use error::ProtoError;
