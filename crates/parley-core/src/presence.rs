//! Presence tracking for Parley.
//!
//! Presence answers two questions about a user: are they online, and which
//! node holds their connection. Both are soft state. The online flag expires
//! unless refreshed by heartbeats, and a stale home node is tolerated because
//! routing to it only costs one dropped publish.

use crate::node::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default lifetime of the online flag.
pub const DEFAULT_ONLINE_TTL: Duration = Duration::from_secs(30);

/// Presence store errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The backing store could not be reached.
    #[error("Presence store unavailable: {0}")]
    Unavailable(String),
}

/// Shared presence cache.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Mark a user online, refreshing the TTL.
    async fn set_online(&self, user_id: &str) -> Result<(), PresenceError>;

    /// Whether the user's online flag is present and unexpired.
    async fn is_online(&self, user_id: &str) -> Result<bool, PresenceError>;

    /// Clear the user's online flag.
    async fn set_offline(&self, user_id: &str) -> Result<(), PresenceError>;

    /// Record the node holding the user's connection.
    async fn set_home_node(&self, user_id: &str, node: &NodeId) -> Result<(), PresenceError>;

    /// Node last recorded for the user, if any.
    async fn home_node(&self, user_id: &str) -> Result<Option<NodeId>, PresenceError>;
}

/// In-process presence store.
///
/// Expiry is checked on read, so an expired entry lingers in memory until it
/// is read or pruned.
#[derive(Debug)]
pub struct MemoryPresenceStore {
    online: DashMap<String, Instant>,
    home_nodes: DashMap<String, NodeId>,
    ttl: Duration,
}

impl MemoryPresenceStore {
    /// Create a store with the given online TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            online: DashMap::new(),
            home_nodes: DashMap::new(),
            ttl,
        }
    }

    /// Number of users whose online flag has not expired.
    #[must_use]
    pub fn online_count(&self) -> usize {
        let now = Instant::now();
        self.online.iter().filter(|e| *e.value() > now).count()
    }

    /// Drop expired online flags.
    ///
    /// Returns the ids that were removed.
    pub fn prune_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .online
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| e.key().clone())
            .collect();

        for id in &expired {
            self.online.remove_if(id, |_, expires| *expires <= now);
            debug!(user = %id, "Presence: pruned expired user");
        }

        expired
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new(DEFAULT_ONLINE_TTL)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, user_id: &str) -> Result<(), PresenceError> {
        trace!(user = %user_id, "Presence: online");
        self.online
            .insert(user_id.to_string(), Instant::now() + self.ttl);
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> Result<bool, PresenceError> {
        Ok(self
            .online
            .get(user_id)
            .is_some_and(|expires| *expires > Instant::now()))
    }

    async fn set_offline(&self, user_id: &str) -> Result<(), PresenceError> {
        trace!(user = %user_id, "Presence: offline");
        self.online.remove(user_id);
        Ok(())
    }

    async fn set_home_node(&self, user_id: &str, node: &NodeId) -> Result<(), PresenceError> {
        self.home_nodes.insert(user_id.to_string(), node.clone());
        Ok(())
    }

    async fn home_node(&self, user_id: &str) -> Result<Option<NodeId>, PresenceError> {
        Ok(self.home_nodes.get(user_id).map(|n| n.value().clone()))
    }
}
