//! In-process transport.
//!
//! [`channel`] returns a connector for the client and a [`MemoryGateway`] that
//! accepts its connections. Each accepted [`MemoryPeer`] sees exactly the frames
//! the client wrote and can inject frames, close cleanly, or drop to simulate an
//! unclean close. Used by tests and local tooling; no sockets involved.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use gatelink_proto::{decode, encode, Frame};
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use super::{Connector, InboundFrame, OutboundFrame, Transport};
use crate::error::GatewayError;

#[derive(Debug, Default)]
struct Shared {
    attempts: AtomicU32,
    refusing: AtomicBool,
    stalled: AtomicBool,
    urls: Mutex<Vec<Url>>,
}

/// Client side of the in-memory transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
    incoming: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server side of the in-memory transport.
#[derive(Debug)]
pub struct MemoryGateway {
    shared: Arc<Shared>,
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Create a connected connector/gateway pair.
#[must_use]
pub fn channel() -> (MemoryConnector, MemoryGateway) {
    let shared = Arc::new(Shared::default());
    let (tx, rx) = mpsc::unbounded();
    (
        MemoryConnector {
            shared: Arc::clone(&shared),
            incoming: tx,
        },
        MemoryGateway {
            shared,
            incoming: rx,
        },
    )
}

impl Connector for MemoryConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, GatewayError>> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        self.shared.urls.lock().push(url.clone());

        if self.shared.stalled.load(Ordering::SeqCst) {
            return future::pending().boxed();
        }
        if self.shared.refusing.load(Ordering::SeqCst) {
            return future::ready(Err(GatewayError::Transport(
                "connection refused".to_string(),
            )))
            .boxed();
        }

        let (client_tx, peer_rx) = mpsc::unbounded::<OutboundFrame>();
        let (peer_tx, client_rx) = mpsc::unbounded::<Result<InboundFrame, GatewayError>>();

        let peer = MemoryPeer {
            url,
            outbound: peer_rx,
            inbound: peer_tx,
        };
        let result = match self.incoming.unbounded_send(peer) {
            Ok(()) => Ok(Transport {
                sink: Box::pin(
                    client_tx.sink_map_err(|e| GatewayError::Transport(format!("peer gone: {e}"))),
                ),
                stream: Box::pin(client_rx),
            }),
            Err(_) => Err(GatewayError::Transport("gateway not listening".to_string())),
        };
        future::ready(result).boxed()
    }
}

impl MemoryGateway {
    /// Wait for the next connection. `None` once every connector is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.next().await
    }

    /// Refuse (or accept again) subsequent handshakes.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Make subsequent handshakes hang forever.
    pub fn set_stalled(&self, stalled: bool) {
        self.shared.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Handshakes attempted so far, including refused ones.
    #[must_use]
    pub fn connection_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// URLs of every handshake attempted so far.
    #[must_use]
    pub fn attempted_urls(&self) -> Vec<Url> {
        self.shared.urls.lock().clone()
    }
}

/// One accepted connection, seen from the gateway.
///
/// Dropping the peer closes the connection without a close frame.
#[derive(Debug)]
pub struct MemoryPeer {
    url: Url,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<Result<InboundFrame, GatewayError>>,
}

impl MemoryPeer {
    /// URL the client connected with.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Next raw frame written by the client. `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.next().await
    }

    /// Next decoded event written by the client. `None` on close.
    /// Undecodable frames are skipped.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            match self.recv().await? {
                OutboundFrame::Binary(bytes) => {
                    if let Ok(frame) = decode(&bytes) {
                        return Some(frame);
                    }
                }
                OutboundFrame::Close { .. } => return None,
            }
        }
    }

    /// Next decoded event other than `heartbeat`. `None` on close.
    pub async fn recv_event(&mut self) -> Option<Frame> {
        loop {
            let frame = self.recv_frame().await?;
            if frame.event_type != gatelink_proto::control::HEARTBEAT {
                return Some(frame);
            }
        }
    }

    /// Send a frame. Returns `false` if the client side is gone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        frame
            .encode()
            .is_ok_and(|bytes| self.send_raw(bytes))
    }

    /// Send an event without a server timestamp.
    pub fn send_event(&self, event_type: &str, payload: Value) -> bool {
        encode(event_type, &payload).is_ok_and(|bytes| self.send_raw(bytes))
    }

    /// Send arbitrary bytes as a binary frame.
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.inbound
            .unbounded_send(Ok(InboundFrame::Binary(bytes)))
            .is_ok()
    }

    /// Send a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .unbounded_send(Ok(InboundFrame::Text(text.into())))
            .is_ok()
    }

    /// Close cleanly with a reason.
    pub fn close(self, reason: impl Into<String>) {
        let _ = self
            .inbound
            .unbounded_send(Ok(InboundFrame::Close(Some(reason.into()))));
    }

    /// Fail the connection with a transport error.
    pub fn fail(self, message: impl Into<String>) {
        let _ = self
            .inbound
            .unbounded_send(Err(GatewayError::Transport(message.into())));
    }
}
