//! WebSocket transport built on `tokio-tungstenite`.

use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use super::{Connector, InboundFrame, OutboundFrame, Transport};
use crate::error::GatewayError;

/// Connects over `ws://` or `wss://`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Connector for TungsteniteConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, GatewayError>> {
        async move {
            let (ws_stream, response) = connect_async(url.as_str())
                .await
                .map_err(|e| GatewayError::Transport(format!("handshake failed: {e}")))?;
            debug!(status = %response.status(), "WebSocket handshake complete");

            let (write, read) = ws_stream.split();

            let sink = write
                .sink_map_err(|e| GatewayError::Transport(e.to_string()))
                .with(|frame: OutboundFrame| future::ready(Ok::<_, GatewayError>(into_message(frame))));

            let stream = read.map(|msg| match msg {
                Ok(msg) => Ok(from_message(msg)),
                Err(e) => Err(GatewayError::Transport(e.to_string())),
            });

            Ok(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }
}

fn into_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Binary(bytes) => Message::Binary(bytes),
        OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_message(msg: Message) -> InboundFrame {
    match msg {
        Message::Binary(bytes) => InboundFrame::Binary(bytes),
        Message::Text(text) => InboundFrame::Text(text),
        Message::Close(frame) => InboundFrame::Close(frame.map(|f| format!("{} {}", u16::from(f.code), f.reason))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => InboundFrame::Keepalive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_mapping() {
        assert_eq!(
            into_message(OutboundFrame::Binary(vec![1, 2, 3])),
            Message::Binary(vec![1, 2, 3])
        );

        match into_message(OutboundFrame::normal_close("bye")) {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn test_inbound_mapping() {
        assert_eq!(from_message(Message::Binary(vec![9])), InboundFrame::Binary(vec![9]));
        assert_eq!(
            from_message(Message::Text("hi".to_string())),
            InboundFrame::Text("hi".to_string())
        );
        assert_eq!(from_message(Message::Ping(vec![])), InboundFrame::Keepalive);
        assert_eq!(from_message(Message::Close(None)), InboundFrame::Close(None));
    }
}
