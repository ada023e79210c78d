//! Inter-node message bus.
//!
//! Every node subscribes to a channel named after its own [`NodeId`] and
//! publishes to the channel of whichever node holds a recipient. Payloads are
//! opaque bytes; the router puts MessagePack encoded envelopes on the bus.
//!
//! [`NodeId`]: crate::node::NodeId

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default buffer between a subscription and its consumer.
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The bus could not be reached.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Publish/subscribe transport between nodes.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Subscribe to a channel.
    ///
    /// Payloads published after this call returns are delivered to the
    /// receiver. The subscription ends when the receiver is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, BusError>;

    /// Publish a payload.
    ///
    /// Returns the number of subscribers that received it. Zero is not an
    /// error: the recipient node may have gone away.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError>;
}

/// In-process bus shared by every node of a test cluster or a standalone
/// server.
#[derive(Debug)]
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
    subscription_buffer: usize,
    published: AtomicU64,
}

impl MemoryBus {
    /// Create a bus with default capacities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with a specific per-channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            published: AtomicU64::new(0),
        }
    }

    /// Total number of publish calls.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of channels with at least one subscriber ever.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, BusError> {
        validate_channel_name(channel).map_err(BusError::InvalidChannel)?;

        let mut source = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel, "Creating bus channel");
                broadcast::channel(self.capacity).0
            })
            .subscribe();

        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        let name = channel.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(channel = %name, "Bus subscription ended");
        });

        Ok(rx)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        validate_channel_name(channel).map_err(BusError::InvalidChannel)?;
        self.published.fetch_add(1, Ordering::Relaxed);

        let receivers = match self.channels.get(channel) {
            Some(sender) => sender.send(payload).unwrap_or_default(),
            None => 0,
        };
        trace!(channel = %channel, receivers, "Published to bus");
        Ok(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("chat-server-1").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("bad\nname").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("node-a").await.unwrap();

        let count = bus.publish("node-a", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("node-a").await.unwrap();
        let _b = bus.subscribe("node-b").await.unwrap();

        bus.publish("node-b", Bytes::from_static(b"for b")).await.unwrap();
        bus.publish("node-a", Bytes::from_static(b"for a")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"for a"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::new();
        let count = bus.publish("nobody", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let bus = MemoryBus::new();
        assert!(matches!(
            bus.publish("", Bytes::new()).await,
            Err(BusError::InvalidChannel(_))
        ));
    }
}
