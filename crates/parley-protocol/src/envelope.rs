//! Envelope types for the Parley protocol.
//!
//! An envelope is the unit exchanged both with clients (JSON text frames) and
//! between nodes over the bus (MessagePack). Every envelope carries exactly one
//! payload, selected by its `type` tag.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A unique message identifier.
pub type MessageId = u64;

/// Envelope kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    PrivateChat,
    PrivateChatBot,
    GroupChat,
    GroupChatBot,
    Presence,
    ContactsPresence,
}

impl EnvelopeKind {
    /// The wire tag for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::PrivateChat => "private_chat",
            EnvelopeKind::PrivateChatBot => "private_chat_bot",
            EnvelopeKind::GroupChat => "group_chat",
            EnvelopeKind::GroupChatBot => "group_chat_bot",
            EnvelopeKind::Presence => "presence",
            EnvelopeKind::ContactsPresence => "contacts_presence",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A one-to-one chat message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned message id (0 until assigned).
    #[serde(default)]
    pub message_id: MessageId,
    /// Username of the author.
    #[serde(default)]
    pub sender: String,
    /// Username of the addressee.
    #[serde(default)]
    pub recipient: String,
    /// Message text.
    pub content: String,
    /// Creation time in unix milliseconds (0 until assigned).
    #[serde(default)]
    pub created_at: u64,
}

/// A message posted to a group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Server-assigned message id (0 until assigned).
    #[serde(default)]
    pub message_id: MessageId,
    /// Group name.
    pub group: String,
    /// Username of the author.
    #[serde(default)]
    pub sender: String,
    /// Member this copy is addressed to; filled in during fan-out.
    #[serde(default)]
    pub recipient: String,
    /// Message text.
    pub content: String,
    /// Creation time in unix milliseconds (0 until assigned).
    #[serde(default)]
    pub created_at: u64,
}

/// Identity of a user as shown to their contacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
}

/// Notification that a contact went online or offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceNotice {
    /// The user whose state changed.
    pub contact: Contact,
    /// New state.
    pub online: bool,
    /// Username of the user being notified.
    pub notify: String,
    /// Creation time in unix milliseconds.
    #[serde(default)]
    pub created_at: u64,
}

/// Online state of a single contact inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactStatus {
    pub contact: Contact,
    pub online: bool,
}

/// Snapshot of every contact's presence, sent when a session becomes active.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactsPresence {
    /// Number of contacts.
    pub total: usize,
    /// Number of contacts currently online.
    pub online: usize,
    pub contacts: Vec<ContactStatus>,
}

impl ContactsPresence {
    /// Build a snapshot, computing the totals from the list.
    #[must_use]
    pub fn new(contacts: Vec<ContactStatus>) -> Self {
        Self {
            total: contacts.len(),
            online: contacts.iter().filter(|c| c.online).count(),
            contacts,
        }
    }
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Chat between two contacts.
    PrivateChat(ChatMessage),
    /// Chat with the bot participant.
    PrivateChatBot(ChatMessage),
    /// Chat posted to a group.
    GroupChat(GroupMessage),
    /// Prompt to the bot inside a group, or the bot's answer.
    GroupChatBot(GroupMessage),
    /// Presence change of a contact.
    Presence(PresenceNotice),
    /// Presence snapshot of every contact.
    ContactsPresence(ContactsPresence),
}

impl Envelope {
    /// Get the envelope kind.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::PrivateChat(_) => EnvelopeKind::PrivateChat,
            Envelope::PrivateChatBot(_) => EnvelopeKind::PrivateChatBot,
            Envelope::GroupChat(_) => EnvelopeKind::GroupChat,
            Envelope::GroupChatBot(_) => EnvelopeKind::GroupChatBot,
            Envelope::Presence(_) => EnvelopeKind::Presence,
            Envelope::ContactsPresence(_) => EnvelopeKind::ContactsPresence,
        }
    }

    /// Username this envelope is routed to, if the kind is routable.
    ///
    /// Bot conversations and presence snapshots are answered directly on the
    /// originating connection and have no routing recipient.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        let name = match self {
            Envelope::PrivateChat(m) => m.recipient.as_str(),
            Envelope::GroupChat(m) | Envelope::GroupChatBot(m) => m.recipient.as_str(),
            Envelope::Presence(p) => p.notify.as_str(),
            Envelope::PrivateChatBot(_) | Envelope::ContactsPresence(_) => return None,
        };
        (!name.is_empty()).then_some(name)
    }

    /// Replace the content with an error description.
    ///
    /// Errors are reported in-band by echoing the offending message kind back
    /// to its sender, so clients can render them inline.
    #[must_use]
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        match &mut self {
            Envelope::PrivateChat(m) | Envelope::PrivateChatBot(m) => {
                m.content = error.to_string();
            }
            Envelope::GroupChat(m) | Envelope::GroupChatBot(m) => {
                m.content = error.to_string();
            }
            Envelope::Presence(_) | Envelope::ContactsPresence(_) => {}
        }
        self
    }

    /// Create a private chat envelope.
    #[must_use]
    pub fn private_chat(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Envelope::PrivateChat(ChatMessage {
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            ..ChatMessage::default()
        })
    }

    /// Create a bot prompt envelope.
    #[must_use]
    pub fn private_chat_bot(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Envelope::PrivateChatBot(ChatMessage {
            sender: sender.into(),
            content: content.into(),
            ..ChatMessage::default()
        })
    }

    /// Create a group chat envelope.
    #[must_use]
    pub fn group_chat(
        group: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Envelope::GroupChat(GroupMessage {
            group: group.into(),
            sender: sender.into(),
            content: content.into(),
            ..GroupMessage::default()
        })
    }

    /// Create a group bot prompt envelope.
    #[must_use]
    pub fn group_chat_bot(
        group: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Envelope::GroupChatBot(GroupMessage {
            group: group.into(),
            sender: sender.into(),
            content: content.into(),
            ..GroupMessage::default()
        })
    }

    /// Create a presence notice for `notify` about `contact`.
    #[must_use]
    pub fn presence(contact: Contact, online: bool, notify: impl Into<String>, created_at: u64) -> Self {
        Envelope::Presence(PresenceNotice {
            contact,
            online,
            notify: notify.into(),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_kind() {
        let chat = Envelope::private_chat("alice", "bob", "hi");
        assert_eq!(chat.kind(), EnvelopeKind::PrivateChat);
        assert_eq!(chat.kind().to_string(), "private_chat");

        let group = Envelope::group_chat("rustaceans", "alice", "hello");
        assert_eq!(group.kind(), EnvelopeKind::GroupChat);
    }

    #[test]
    fn test_recipient() {
        assert_eq!(
            Envelope::private_chat("alice", "bob", "hi").recipient(),
            Some("bob")
        );
        assert_eq!(Envelope::private_chat_bot("alice", "hi").recipient(), None);
        // Group messages are only routable once fan-out fills in a member.
        assert_eq!(Envelope::group_chat("g", "alice", "hi").recipient(), None);

        let contact = Contact {
            id: "1".into(),
            username: "alice".into(),
            email: String::new(),
        };
        assert_eq!(
            Envelope::presence(contact, true, "carol", 0).recipient(),
            Some("carol")
        );
        assert_eq!(
            Envelope::ContactsPresence(ContactsPresence::default()).recipient(),
            None
        );
    }

    #[test]
    fn test_with_error_replaces_content() {
        let env = Envelope::private_chat("alice", "bob", "hi").with_error("bob is not your contact");
        match env {
            Envelope::PrivateChat(m) => {
                assert_eq!(m.content, "bob is not your contact");
                assert_eq!(m.recipient, "bob");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn test_client_json_shape() {
        // Clients omit server-assigned fields.
        let raw = r#"{"type":"private_chat","recipient":"bob","content":"hi"}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        match env {
            Envelope::PrivateChat(m) => {
                assert_eq!(m.recipient, "bob");
                assert_eq!(m.message_id, 0);
                assert!(m.sender.is_empty());
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":"subscribe","channel":"x"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn test_contacts_presence_totals() {
        let c = |name: &str, online| ContactStatus {
            contact: Contact {
                id: name.into(),
                username: name.into(),
                email: String::new(),
            },
            online,
        };
        let snapshot = ContactsPresence::new(vec![c("a", true), c("b", false), c("c", true)]);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.online, 2);
    }
}
