//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`Connection`] traits. Client
//! envelopes travel as JSON text frames; heartbeats use WebSocket ping/pong
//! control frames.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{codec, Envelope};
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::traits::{Connection, FrameSink, FrameSource, Inbound, TransportError};

/// Default maximum client frame size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024;

/// An upgraded WebSocket connection.
pub struct WebSocketConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_frame_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_frame_size: usize) -> Self {
        Self {
            socket,
            remote_addr: None,
            max_frame_size,
        }
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl Connection for WebSocketConnection {
    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|a| a.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketSource {
                stream,
                max_frame_size: self.max_frame_size,
            }),
            Box::new(WebSocketSink { sink, open: true }),
        )
    }
}

/// Read half of a [`WebSocketConnection`].
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope = codec::decode_json(text.as_bytes(), self.max_frame_size)?;
                    return Ok(Some(Inbound::Envelope(envelope)));
                }
                Some(Ok(Message::Binary(data))) => {
                    // Some clients send JSON as binary frames.
                    let envelope = codec::decode_json(&data, self.max_frame_size)?;
                    return Ok(Some(Inbound::Envelope(envelope)));
                }
                Some(Ok(Message::Ping(_))) => {
                    // Answered by the WebSocket implementation.
                }
                Some(Ok(Message::Pong(_))) => {
                    return Ok(Some(Inbound::Pong));
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket receive error");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

/// Write half of a [`WebSocketConnection`].
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    open: bool,
}

impl WebSocketSink {
    async fn send_message(&mut self, message: Message) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.sink.send(message).await.map_err(|e| {
            self.open = false;
            TransportError::SendFailed(e.to_string())
        })
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = codec::encode_json(envelope)?;
        self.send_message(Message::Text(text)).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.send_message(Message::Ping(Vec::new())).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(()); // Already closed
        }
        self.open = false;

        // The peer may already be gone; a failed close handshake is not an error.
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            debug!(error = %e, "Failed to send close frame");
        }
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "Failed to close WebSocket sink");
        }
        Ok(())
    }
}
