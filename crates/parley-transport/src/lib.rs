//! # parley-transport
//!
//! Connection abstraction layer for the Parley chat backend.
//!
//! Sessions never touch a socket directly. They receive a [`Connection`]
//! that has already passed the handshake and split it into a read half and a
//! write half:
//!
//! - **WebSocket** - axum upgraded sockets, JSON text frames
//! - **Memory** - in-process pair used by tests and tooling
//!
//! ```rust,ignore
//! use parley_transport::{Connection, Inbound};
//!
//! async fn handle(conn: Box<dyn Connection>) {
//!     let (mut source, mut sink) = conn.split();
//!     while let Ok(Some(Inbound::Envelope(envelope))) = source.recv().await {
//!         sink.send(&envelope).await.ok();
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, FrameSink, FrameSource, Inbound, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
