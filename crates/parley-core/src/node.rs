//! Node identity.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// Prefix of generated node ids.
pub const NODE_ID_PREFIX: &str = "chat-server-";

/// Identity of one chat-server instance.
///
/// The id doubles as the name of the bus channel the node listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(format!("{NODE_ID_PREFIX}{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bus channel this node subscribes to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.0
    }

    /// Machine id for the id generator, derived from the node id.
    ///
    /// This is a 16-bit hash, so two nodes can collide and then mint equal
    /// message ids. Clusters should assign machine ids explicitly.
    #[must_use]
    pub fn machine_id(&self) -> u16 {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish() as u16
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(NODE_ID_PREFIX));
        assert_eq!(a.channel(), a.as_str());
    }

    #[test]
    fn test_machine_id_is_stable() {
        let node = NodeId::new("chat-server-1");
        assert_eq!(node.machine_id(), NodeId::from("chat-server-1").machine_id());
    }
}
