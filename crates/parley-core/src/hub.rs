//! Connection hub.
//!
//! The hub owns the set of live sessions on this node. A single task runs the
//! coordination loop and is the only code that touches the set; everything
//! else talks to it through a [`HubHandle`] over a bounded command channel.
//!
//! ```text
//!   sessions ──register/unregister──┐
//!   router ────deliver──────────────┼──▶ command channel ──▶ Hub::run
//!   bus forwarder ──deliver─────────┘                          │
//!                                                              ▼
//!                                                   session inboxes (try_send)
//! ```

use crate::bus::{Bus, BusError};
use crate::metrics::{self, DeliveryPath};
use crate::node::NodeId;
use bytes::Bytes;
use parley_protocol::{codec, Envelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Locally unique session identifier, assigned by the hub.
pub type SessionId = u64;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub loop has stopped.
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the command channel.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
        }
    }
}

/// A live session as seen by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub username: String,
}

enum Command {
    Register {
        username: String,
        inbox: mpsc::Sender<Envelope>,
        reply: oneshot::Sender<SessionId>,
    },
    Unregister {
        id: SessionId,
    },
    Deliver {
        envelope: Envelope,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
}

struct SessionEntry {
    username: String,
    inbox: mpsc::Sender<Envelope>,
}

/// The per-node session registry and its coordination loop.
pub struct Hub {
    commands: mpsc::Receiver<Command>,
    sessions: HashMap<SessionId, SessionEntry>,
    by_username: HashMap<String, Vec<SessionId>>,
    next_id: SessionId,
    live: Arc<AtomicUsize>,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    ///
    /// The hub does nothing until [`Hub::run`] is spawned.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let live = Arc::new(AtomicUsize::new(0));
        let hub = Self {
            commands: rx,
            sessions: HashMap::new(),
            by_username: HashMap::new(),
            next_id: 1,
            live: Arc::clone(&live),
        };
        (hub, HubHandle { commands: tx, live })
    }

    /// Run the coordination loop until shutdown or until every handle is
    /// dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Hub started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        self.sessions.clear();
        self.by_username.clear();
        self.publish_live_count();
        info!("Hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                username,
                inbox,
                reply,
            } => {
                let id = self.register(username, inbox);
                if reply.send(id).is_err() {
                    // Caller went away before learning its id.
                    self.unregister(id);
                }
            }
            Command::Unregister { id } => {
                self.unregister(id);
            }
            Command::Deliver { envelope } => {
                self.deliver(&envelope);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn register(&mut self, username: String, inbox: mpsc::Sender<Envelope>) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;

        self.by_username.entry(username.clone()).or_default().push(id);
        debug!(session = id, user = %username, "Session registered");
        self.sessions.insert(id, SessionEntry { username, inbox });
        self.publish_live_count();
        id
    }

    fn unregister(&mut self, id: SessionId) -> bool {
        let Some(entry) = self.sessions.remove(&id) else {
            debug!(session = id, "Unregister of unknown session");
            return false;
        };

        if let Some(ids) = self.by_username.get_mut(&entry.username) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_username.remove(&entry.username);
            }
        }
        debug!(session = id, user = %entry.username, "Session unregistered");
        self.publish_live_count();
        true
    }

    /// Hand an envelope to every live session of its recipient.
    ///
    /// Returns the number of inboxes that accepted it.
    fn deliver(&self, envelope: &Envelope) -> usize {
        let Some(recipient) = envelope.recipient() else {
            warn!(kind = %envelope.kind(), "Dropping envelope without recipient");
            return 0;
        };
        let Some(ids) = self.by_username.get(recipient) else {
            trace!(user = %recipient, "No live session for recipient");
            return 0;
        };

        let mut delivered = 0;
        for id in ids {
            let Some(entry) = self.sessions.get(id) else {
                continue;
            };
            match entry.inbox.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        session = id,
                        user = %recipient,
                        kind = %envelope.kind(),
                        "Inbox full, dropping envelope"
                    );
                    metrics::record_delivery_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(session = id, "Inbox closed, session is tearing down");
                }
            }
        }
        delivered
    }

    fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                username: entry.username.clone(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    fn publish_live_count(&self) {
        let count = self.sessions.len();
        self.live.store(count, Ordering::Release);
        metrics::set_live_sessions(count);
    }
}

/// Cloneable handle to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    live: Arc<AtomicUsize>,
}

impl HubHandle {
    /// Add a session to the live set.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub loop has stopped.
    pub async fn register(
        &self,
        username: &str,
        inbox: mpsc::Sender<Envelope>,
    ) -> Result<SessionId, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            username: username.to_string(),
            inbox,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove a session from the live set. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub loop has stopped.
    pub async fn unregister(&self, id: SessionId) -> Result<(), HubError> {
        self.send(Command::Unregister { id }).await
    }

    /// Queue an envelope for every local session of its recipient.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub loop has stopped.
    pub async fn deliver(&self, envelope: Envelope) -> Result<(), HubError> {
        self.send(Command::Deliver { envelope }).await
    }

    /// Snapshot of the live set, ordered by session id.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub loop has stopped.
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Number of live sessions, without a round-trip to the hub.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}

/// Subscription to this node's bus channel, feeding the hub.
pub struct BusForwarder {
    node: NodeId,
    payloads: mpsc::Receiver<Bytes>,
}

impl BusForwarder {
    /// Subscribe to the node's own channel.
    ///
    /// Subscribing before the server accepts connections guarantees no
    /// envelope published for this node afterwards is missed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus refuses the subscription.
    pub async fn subscribe(bus: &dyn Bus, node: NodeId) -> Result<Self, BusError> {
        let payloads = bus.subscribe(node.channel()).await?;
        info!(node = %node, "Subscribed to node channel");
        Ok(Self { node, payloads })
    }

    /// Decode every payload and hand it to the hub.
    ///
    /// Malformed payloads are logged, counted and skipped. Stops on shutdown,
    /// when the subscription ends or when the hub stops.
    pub async fn run(mut self, hub: HubHandle, shutdown: CancellationToken) {
        loop {
            let payload = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                payload = self.payloads.recv() => match payload {
                    Some(payload) => payload,
                    None => {
                        warn!(node = %self.node, "Bus subscription ended");
                        break;
                    }
                },
            };

            let envelope = match codec::decode(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(node = %self.node, error = %e, bytes = payload.len(), "Dropping malformed bus payload");
                    metrics::record_bus_decode_error();
                    continue;
                }
            };

            metrics::record_delivery(DeliveryPath::Bus);
            if hub.deliver(envelope).await.is_err() {
                debug!(node = %self.node, "Hub stopped, bus forwarder exiting");
                break;
            }
        }
        debug!(node = %self.node, "Bus forwarder stopped");
    }
}

/// Subscribe to the node's channel and forward into the hub until shutdown.
///
/// # Errors
///
/// Returns an error if the subscription cannot be established.
pub async fn forward_from_bus(
    bus: Arc<dyn Bus>,
    node: NodeId,
    hub: HubHandle,
    shutdown: CancellationToken,
) -> Result<(), BusError> {
    BusForwarder::subscribe(bus.as_ref(), node)
        .await?
        .run(hub, shutdown)
        .await;
    Ok(())
}
