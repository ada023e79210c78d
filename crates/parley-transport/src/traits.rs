//! Transport abstraction traits for Parley.
//!
//! A session reads and writes from two different tasks, so every connection
//! is split into a [`FrameSource`] (read half) and a [`FrameSink`] (write half)
//! before the session starts.

use async_trait::async_trait;
use parley_protocol::{Envelope, ProtocolError};
use thiserror::Error;

/// Something received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A decoded envelope.
    Envelope(Envelope),
    /// Answer to a server heartbeat ping.
    Pong,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A write did not complete in time.
    #[error("Write timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed or oversized frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error was caused by the client sending a bad frame.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next inbound item.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Serialize and send an envelope.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Send a heartbeat ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An established, authorized client connection.
pub trait Connection: Send {
    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independent read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);
}
