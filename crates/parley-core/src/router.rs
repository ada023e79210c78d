//! Location-aware message router.
//!
//! The router turns client envelopes into deliveries. For every recipient it
//! asks the presence store where the user is connected and either hands the
//! envelope to the local hub or publishes it on the bus channel of the node
//! that holds the connection.
//!
//! ```text
//!                       ┌──────────────┐
//!   session ──handle──▶ │    Router    │──locate──▶ PresenceStore
//!                       └──────┬───────┘
//!                  same node   │   other node
//!               ┌──────────────┴───────────────┐
//!               ▼                              ▼
//!          HubHandle::deliver          Bus::publish(node channel)
//! ```
//!
//! Business failures (not a contact, not a group member, unknown user or
//! group) and failures of collaborators needed to proceed are answered
//! in-band: the sender gets back the envelope kind they sent with the error
//! text as content. Persistence failures are logged and never block
//! delivery.

use crate::bus::{Bus, BusError};
use crate::directory::{ContactDirectory, DirectoryError, GroupDirectory, UserProfile};
use crate::generator::{GenerationError, TextGenerator};
use crate::hub::{HubError, HubHandle};
use crate::id::{unix_millis, IdError, IdGenerator};
use crate::metrics::{self, DeliveryPath};
use crate::node::NodeId;
use crate::presence::{PresenceError, PresenceStore};
use crate::session::Dispatcher;
use crate::store::{GroupRecord, MessageStore, PrivateRecord};
use async_trait::async_trait;
use parley_protocol::{
    codec, ChatMessage, ContactStatus, ContactsPresence, Envelope, GroupMessage, ProtocolError,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Default display name of the bot participant.
pub const DEFAULT_BOT_NAME: &str = "ChatBot";

/// Errors raised while handling a client envelope.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0} is not your contact")]
    NotContact(String),

    #[error("user {0} not found")]
    UnknownUser(String),

    #[error("group {0} not found")]
    GroupNotFound(String),

    #[error("you are not a member of group {0}")]
    NotGroupMember(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("{0}")]
    Generation(#[from] GenerationError),

    #[error("Failed to assign message id: {0}")]
    Id(#[from] IdError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
}

impl ChatError {
    /// Whether the error is the client's doing rather than a server fault.
    #[must_use]
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            ChatError::NotContact(_)
                | ChatError::UnknownUser(_)
                | ChatError::GroupNotFound(_)
                | ChatError::NotGroupMember(_)
        )
    }
}

impl From<DirectoryError> for ChatError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::UnknownUser(name) => ChatError::UnknownUser(name),
            DirectoryError::GroupNotFound(group) => ChatError::GroupNotFound(group),
            DirectoryError::NotGroupMember { group, .. } => ChatError::NotGroupMember(group),
            DirectoryError::Unavailable(msg) => ChatError::Directory(msg),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Sender name on bot answers.
    pub bot_name: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bot_name: DEFAULT_BOT_NAME.to_string(),
        }
    }
}

/// External collaborators used by the router.
#[derive(Clone)]
pub struct Services {
    pub presence: Arc<dyn PresenceStore>,
    pub bus: Arc<dyn Bus>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub groups: Arc<dyn GroupDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub generator: Arc<dyn TextGenerator>,
    pub ids: Arc<IdGenerator>,
}

/// Where a user is connected, as far as presence knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Online and connected to this node.
    pub same_node: bool,
    /// Last recorded home node.
    pub home_node: Option<NodeId>,
}

/// Outcome of routing one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the local hub.
    Local,
    /// Published to the named node.
    Remote(NodeId),
    /// No home node recorded; nothing was sent.
    Offline,
}

/// Message router for one node.
pub struct Router {
    node: NodeId,
    hub: HubHandle,
    services: Services,
    config: RouterConfig,
}

impl Router {
    /// Create a router.
    #[must_use]
    pub fn new(node: NodeId, hub: HubHandle, services: Services, config: RouterConfig) -> Self {
        info!(node = %node, bot = %config.bot_name, "Creating router");
        Self {
            node,
            hub,
            services,
            config,
        }
    }

    /// The node this router runs on.
    #[must_use]
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Find where a user is connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the presence store fails.
    pub async fn locate(&self, user_id: &str) -> Result<Location, ChatError> {
        let home_node = self.services.presence.home_node(user_id).await?;
        let online = self.services.presence.is_online(user_id).await?;
        Ok(Location {
            same_node: online && home_node.as_ref() == Some(&self.node),
            home_node,
        })
    }

    /// Send an envelope towards a user, wherever they are connected.
    ///
    /// Delivery is fire-and-forget: `Local` and `Remote` only mean the
    /// envelope was handed on.
    ///
    /// # Errors
    ///
    /// Returns an error if presence lookup, encoding, publishing or the
    /// local hub fails.
    pub async fn route_to_user(
        &self,
        user: &UserProfile,
        envelope: Envelope,
    ) -> Result<Delivery, ChatError> {
        let location = self.locate(&user.id).await?;

        if location.same_node {
            trace!(user = %user.username, kind = %envelope.kind(), "Delivering locally");
            self.hub.deliver(envelope).await?;
            metrics::record_delivery(DeliveryPath::Local);
            return Ok(Delivery::Local);
        }

        match location.home_node {
            Some(node) => {
                let payload = codec::encode(&envelope)?;
                let receivers = self.services.bus.publish(node.channel(), payload).await?;
                trace!(
                    user = %user.username,
                    kind = %envelope.kind(),
                    node = %node,
                    receivers,
                    "Published to remote node"
                );
                metrics::record_delivery(DeliveryPath::Remote);
                Ok(Delivery::Remote(node))
            }
            None => {
                debug!(user = %user.username, kind = %envelope.kind(), "Recipient has no home node");
                metrics::record_delivery(DeliveryPath::Offline);
                Ok(Delivery::Offline)
            }
        }
    }

    /// Tell every contact of `user` that they went online or offline.
    ///
    /// Returns the number of contacts the notice was routed to. Failures for
    /// one contact do not stop the others.
    pub async fn fanout_presence(&self, user: &UserProfile, online: bool) -> usize {
        let contacts = match self.services.contacts.contacts_of(&user.id).await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!(user = %user.username, error = %e, "Failed to load contacts for presence");
                return 0;
            }
        };

        let now = unix_millis();
        let mut routed = 0;
        for contact in &contacts {
            let notice = Envelope::presence(user.contact(), online, &contact.username, now);
            match self.route_to_user(contact, notice).await {
                Ok(_) => routed += 1,
                Err(e) => {
                    warn!(
                        user = %user.username,
                        contact = %contact.username,
                        error = %e,
                        "Failed to route presence notice"
                    );
                }
            }
        }

        metrics::record_presence_fanout(online, routed);
        debug!(user = %user.username, online, contacts = routed, "Presence fanned out");
        routed
    }

    /// Online state of every contact of `user`.
    ///
    /// A contact whose state cannot be read is reported offline.
    ///
    /// # Errors
    ///
    /// Returns an error if the contact list cannot be loaded.
    pub async fn contacts_presence(&self, user: &UserProfile) -> Result<Envelope, ChatError> {
        let contacts = self.services.contacts.contacts_of(&user.id).await?;

        let mut statuses = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let online = match self.services.presence.is_online(&contact.id).await {
                Ok(online) => online,
                Err(e) => {
                    warn!(contact = %contact.username, error = %e, "Failed to read presence");
                    false
                }
            };
            statuses.push(ContactStatus {
                contact: contact.contact(),
                online,
            });
        }

        Ok(Envelope::ContactsPresence(ContactsPresence::new(statuses)))
    }

    /// Dispatch one client envelope by kind.
    ///
    /// Returns the reply for the sender, if any.
    pub async fn handle(&self, user: &UserProfile, envelope: Envelope) -> Option<Envelope> {
        match envelope {
            Envelope::PrivateChat(msg) => self.handle_private_chat(user, msg).await,
            Envelope::PrivateChatBot(msg) => self.handle_private_bot(user, msg).await,
            Envelope::GroupChat(msg) => self.handle_group_chat(user, msg).await,
            Envelope::GroupChatBot(msg) => self.handle_group_bot(user, msg).await,
            other @ (Envelope::Presence(_) | Envelope::ContactsPresence(_)) => {
                warn!(user = %user.username, kind = %other.kind(), "Ignoring server-only envelope from client");
                None
            }
        }
    }

    /// Deliver a private message to a contact.
    ///
    /// The sender gets no copy; only failures are answered.
    pub async fn handle_private_chat(
        &self,
        user: &UserProfile,
        mut msg: ChatMessage,
    ) -> Option<Envelope> {
        msg.sender = user.username.clone();
        let original = Envelope::PrivateChat(msg.clone());
        match self.private_chat(user, msg).await {
            Ok(()) => None,
            Err(e) => Some(self.reject(user, original, e)),
        }
    }

    async fn private_chat(&self, user: &UserProfile, mut msg: ChatMessage) -> Result<(), ChatError> {
        let recipient = self.services.contacts.resolve_user(&msg.recipient).await?;
        if !self
            .services
            .contacts
            .is_contact(&user.id, &recipient.id)
            .await?
        {
            return Err(ChatError::NotContact(recipient.username));
        }

        msg.recipient = recipient.username.clone();
        msg.message_id = self.services.ids.next_id()?;
        msg.created_at = unix_millis();

        let record = PrivateRecord {
            message_id: msg.message_id,
            sender: user.id.clone(),
            recipient: recipient.id.clone(),
            content: msg.content.clone(),
            created_at: msg.created_at,
        };
        if let Err(e) = self.services.messages.append_private(record).await {
            error!(message_id = msg.message_id, error = %e, "Failed to persist private message");
        }

        let delivery = self
            .route_to_user(&recipient, Envelope::PrivateChat(msg))
            .await?;
        debug!(from = %user.username, to = %recipient.username, ?delivery, "Private message routed");
        Ok(())
    }

    /// Post a message to a group.
    ///
    /// Stored once, then routed to every member except the sender.
    pub async fn handle_group_chat(
        &self,
        user: &UserProfile,
        mut msg: GroupMessage,
    ) -> Option<Envelope> {
        msg.sender = user.username.clone();
        let original = Envelope::GroupChat(msg.clone());
        match self.group_chat(user, msg).await {
            Ok(()) => None,
            Err(e) => Some(self.reject(user, original, e)),
        }
    }

    async fn group_chat(&self, user: &UserProfile, mut msg: GroupMessage) -> Result<(), ChatError> {
        let members = self.services.groups.members_of(&msg.group, &user.id).await?;

        msg.message_id = self.services.ids.next_id()?;
        msg.created_at = unix_millis();
        self.persist_group(user, &msg, false).await;

        let routed = self
            .fanout_group(user, &members, &msg, Envelope::GroupChat)
            .await;
        debug!(from = %user.username, group = %msg.group, members = routed, "Group message routed");
        Ok(())
    }

    /// Answer a private prompt to the bot.
    pub async fn handle_private_bot(
        &self,
        user: &UserProfile,
        mut msg: ChatMessage,
    ) -> Option<Envelope> {
        msg.sender = user.username.clone();
        let original = Envelope::PrivateChatBot(msg.clone());
        match self.private_bot(user, msg).await {
            Ok(reply) => Some(reply),
            Err(e) => Some(self.reject(user, original, e)),
        }
    }

    async fn private_bot(&self, user: &UserProfile, msg: ChatMessage) -> Result<Envelope, ChatError> {
        let answer = self.services.generator.generate(&msg.content).await?;
        Ok(Envelope::PrivateChatBot(ChatMessage {
            message_id: self.services.ids.next_id()?,
            sender: self.config.bot_name.clone(),
            recipient: user.username.clone(),
            content: answer,
            created_at: unix_millis(),
        }))
    }

    /// Answer a bot prompt inside a group.
    ///
    /// Prompt and answer are both stored. The sender gets the answer as the
    /// reply and every other member gets it routed.
    pub async fn handle_group_bot(
        &self,
        user: &UserProfile,
        mut msg: GroupMessage,
    ) -> Option<Envelope> {
        msg.sender = user.username.clone();
        let original = Envelope::GroupChatBot(msg.clone());
        match self.group_bot(user, msg).await {
            Ok(reply) => Some(reply),
            Err(e) => Some(self.reject(user, original, e)),
        }
    }

    async fn group_bot(&self, user: &UserProfile, mut prompt: GroupMessage) -> Result<Envelope, ChatError> {
        let members = self
            .services
            .groups
            .members_of(&prompt.group, &user.id)
            .await?;
        let answer = self.services.generator.generate(&prompt.content).await?;

        prompt.message_id = self.services.ids.next_id()?;
        prompt.created_at = unix_millis();
        self.persist_group(user, &prompt, false).await;

        let reply = GroupMessage {
            message_id: self.services.ids.next_id()?,
            group: prompt.group,
            sender: self.config.bot_name.clone(),
            recipient: user.username.clone(),
            content: answer,
            created_at: unix_millis(),
        };
        self.persist_group(user, &reply, true).await;

        self.fanout_group(user, &members, &reply, Envelope::GroupChatBot)
            .await;
        Ok(Envelope::GroupChatBot(reply))
    }

    async fn persist_group(&self, author: &UserProfile, msg: &GroupMessage, from_bot: bool) {
        let record = GroupRecord {
            message_id: msg.message_id,
            group: msg.group.clone(),
            author: author.id.clone(),
            from_bot,
            content: msg.content.clone(),
            created_at: msg.created_at,
        };
        if let Err(e) = self.services.messages.append_group(record).await {
            error!(message_id = msg.message_id, group = %msg.group, error = %e, "Failed to persist group message");
        }
    }

    /// Route a copy of `msg` to every member except `sender`.
    async fn fanout_group(
        &self,
        sender: &UserProfile,
        members: &[UserProfile],
        msg: &GroupMessage,
        wrap: fn(GroupMessage) -> Envelope,
    ) -> usize {
        let mut routed = 0;
        for member in members.iter().filter(|m| m.id != sender.id) {
            let mut copy = msg.clone();
            copy.recipient = member.username.clone();
            match self.route_to_user(member, wrap(copy)).await {
                Ok(_) => routed += 1,
                Err(e) => {
                    warn!(group = %msg.group, member = %member.username, error = %e, "Failed to route group message");
                }
            }
        }
        routed
    }

    /// Turn a failure into the in-band reply for the sender.
    fn reject(&self, user: &UserProfile, original: Envelope, err: ChatError) -> Envelope {
        let kind = original.kind();
        if err.is_business() {
            debug!(user = %user.username, %kind, error = %err, "Rejected envelope");
        } else {
            warn!(user = %user.username, %kind, error = %err, "Failed to handle envelope");
        }
        metrics::record_envelope_rejected(kind);

        let mut reply = original.with_error(&err);
        let now = unix_millis();
        match &mut reply {
            Envelope::PrivateChat(m) | Envelope::PrivateChatBot(m) => {
                m.created_at = now;
                if m.recipient.is_empty() {
                    m.recipient = user.username.clone();
                }
            }
            Envelope::GroupChat(m) | Envelope::GroupChatBot(m) => {
                m.created_at = now;
                m.recipient = user.username.clone();
            }
            Envelope::Presence(_) | Envelope::ContactsPresence(_) => {}
        }
        reply
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn connected(&self, user: &UserProfile) -> Option<Envelope> {
        if let Err(e) = self.services.presence.set_home_node(&user.id, &self.node).await {
            error!(user = %user.username, error = %e, "Failed to record home node");
        }
        if let Err(e) = self.services.presence.set_online(&user.id).await {
            error!(user = %user.username, error = %e, "Failed to mark user online");
        }
        self.fanout_presence(user, true).await;

        match self.contacts_presence(user).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(user = %user.username, error = %e, "Failed to build contacts presence");
                None
            }
        }
    }

    async fn heartbeat(&self, user: &UserProfile) {
        if let Err(e) = self.services.presence.set_online(&user.id).await {
            warn!(user = %user.username, error = %e, "Failed to refresh online state");
        }
        self.fanout_presence(user, true).await;
    }

    async fn dispatch(&self, user: &UserProfile, envelope: Envelope) -> Option<Envelope> {
        self.handle(user, envelope).await
    }

    async fn disconnected(&self, user: &UserProfile) {
        if let Err(e) = self.services.presence.set_offline(&user.id).await {
            warn!(user = %user.username, error = %e, "Failed to mark user offline");
        }
        self.fanout_presence(user, false).await;
    }
}
