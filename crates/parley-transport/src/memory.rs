//! In-process connection.
//!
//! A [`MemoryConnection`] behaves like an accepted client connection but is
//! driven from the same process through its [`MemoryClient`] peer. Frames
//! still go through the JSON codec on the way in, so size limits and decode
//! failures behave as they do on a real socket.

use async_trait::async_trait;
use parley_protocol::{codec, Envelope};
use tokio::sync::mpsc;

use crate::traits::{Connection, FrameSink, FrameSource, Inbound, TransportError};

/// Frame sent by the client side.
#[derive(Debug)]
enum ClientFrame {
    Text(String),
    Pong,
    Close,
}

/// Frame written by the server side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Envelope(Envelope),
    Ping,
    Close,
}

/// Create a connected server/client pair.
#[must_use]
pub fn pair(max_frame_size: usize) -> (MemoryConnection, MemoryClient) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    (
        MemoryConnection {
            inbound: client_rx,
            outbound: server_tx,
            max_frame_size,
        },
        MemoryClient {
            outbound: client_tx,
            inbound: server_rx,
        },
    )
}

/// Server side of an in-process connection.
pub struct MemoryConnection {
    inbound: mpsc::UnboundedReceiver<ClientFrame>,
    outbound: mpsc::UnboundedSender<Outbound>,
    max_frame_size: usize,
}

impl Connection for MemoryConnection {
    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        (
            Box::new(MemorySource {
                inbound: self.inbound,
                max_frame_size: self.max_frame_size,
            }),
            Box::new(MemorySink {
                outbound: Some(self.outbound),
            }),
        )
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<ClientFrame>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.inbound.recv().await {
            Some(ClientFrame::Text(text)) => {
                let envelope = codec::decode_json(text.as_bytes(), self.max_frame_size)?;
                Ok(Some(Inbound::Envelope(envelope)))
            }
            Some(ClientFrame::Pong) => Ok(Some(Inbound::Pong)),
            Some(ClientFrame::Close) | None => Ok(None),
        }
    }
}

struct MemorySink {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl MemorySink {
    fn push(&mut self, frame: Outbound) -> Result<(), TransportError> {
        let tx = self.outbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .map_err(|_| TransportError::SendFailed("client gone".to_string()))
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.push(Outbound::Envelope(envelope.clone()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.push(Outbound::Ping)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Outbound::Close);
        }
        Ok(())
    }
}

/// Client side of an in-process connection.
pub struct MemoryClient {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    inbound: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryClient {
    /// Send an envelope as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded or the server side
    /// has gone away.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = codec::encode_json(envelope)?;
        self.send_text(text)
    }

    /// Send a raw text frame, bypassing the encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound
            .send(ClientFrame::Text(text.into()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Answer a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side has gone away.
    pub fn pong(&self) -> Result<(), TransportError> {
        self.outbound
            .send(ClientFrame::Pong)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the connection from the client side.
    pub fn close(&self) {
        let _ = self.outbound.send(ClientFrame::Close);
    }

    /// Receive the next frame written by the server.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.inbound.recv().await
    }

    /// Receive the next envelope, skipping heartbeat pings.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.inbound.recv().await? {
                Outbound::Envelope(envelope) => return Some(envelope),
                Outbound::Ping => continue,
                Outbound::Close => return None,
            }
        }
    }

    /// Return an envelope if one is already queued, skipping pings.
    pub fn try_recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.inbound.try_recv().ok()? {
                Outbound::Envelope(envelope) => return Some(envelope),
                Outbound::Ping => continue,
                Outbound::Close => return None,
            }
        }
    }
}
