//! WebSocket Transport Layer
//!
//! Single responsibility: Connect to a WebSocket and send/receive text frames.
//! No knowledge of channels, joins, or request correlation.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::borrow::Cow;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame, Message},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use super::protocol::{ABNORMAL_CLOSURE, NO_STATUS_RECEIVED};
use crate::error::{ChannelError, Result};

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// The socket reported an error. A `Closed` event follows.
    Error(String),
    Closed { code: u16, reason: String },
}

/// A connected WebSocket transport.
///
/// It can only be constructed via `Transport::connect()`.
pub struct Transport {
    sink: WsSink,
    stream: WsStream,
}

impl Transport {
    /// Connect to a WebSocket endpoint.
    ///
    /// Returns a Transport only when the connection is established.
    pub async fn connect(url: String) -> Result<Self> {
        debug!(url = %url, "Connecting to WebSocket");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Transport(format!("Invalid server URL {}: {}", url, e)))?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static("http://localhost"));

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| ChannelError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Self { sink, stream })
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to send: {}", e)))
    }

    /// Wait for the next meaningful event.
    ///
    /// Skips ping/pong (pong is handled automatically by tungstenite).
    /// A stream that ends without a close frame is reported as an abnormal closure.
    pub async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return SocketEvent::Text(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return SocketEvent::Text(text),
                    Err(_) => {
                        debug!("Skipping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => SocketEvent::Closed {
                            code: u16::from(frame.code),
                            reason: frame.reason.into_owned(),
                        },
                        None => SocketEvent::Closed {
                            code: NO_STATUS_RECEIVED,
                            reason: String::new(),
                        },
                    }
                }
                Some(Ok(_)) => continue, // ping, pong, raw frames
                Some(Err(e)) => return SocketEvent::Error(e.to_string()),
                None => {
                    return SocketEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "connection dropped".into(),
                    }
                }
            }
        }
    }

    /// Close the socket with `code`, consuming the transport.
    pub async fn close(mut self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(reason),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Close frame not delivered");
        }
        let _ = self.sink.close().await;
    }
}
