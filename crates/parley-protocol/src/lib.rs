//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat backend.
//!
//! This crate defines the envelope exchanged with clients and between
//! nodes, along with its codecs.
//!
//! ## Envelope Types
//!
//! - `PrivateChat` / `PrivateChatBot` - One-to-one chat and bot prompts
//! - `GroupChat` / `GroupChatBot` - Group chat and group bot prompts
//! - `Presence` - A contact went online or offline
//! - `ContactsPresence` - Snapshot of every contact's presence
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::private_chat("alice", "bob", "hi");
//!
//! // Client frames are JSON, bus frames are MessagePack.
//! let text = codec::encode_json(&envelope).unwrap();
//! let bus = codec::encode(&envelope).unwrap();
//! assert_eq!(codec::decode(&bus).unwrap(), envelope);
//! assert_eq!(codec::decode_json(text.as_bytes(), 1024).unwrap(), envelope);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{
    ChatMessage, Contact, ContactStatus, ContactsPresence, Envelope, EnvelopeKind, GroupMessage,
    MessageId, PresenceNotice,
};
