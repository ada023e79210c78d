//! # parley-core
//!
//! Session registry, presence and location-aware routing for the Parley chat
//! backend.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Per-node registry of live sessions behind a single command loop
//! - **Router** - Decides between local delivery and publishing to another node
//! - **Session** - Heartbeats, read loop, write pump and teardown of one client
//! - **Presence** - Soft online state and home node of every user
//! - **Bus** - Publish/subscribe between nodes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │────▶│     Hub     │──▶ local sessions
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │               ▲
//!                        ▼       ▼               │
//!               ┌──────────┐  ┌─────────┐  ┌───────────┐
//!               │ Presence │  │   Bus   │─▶│ Forwarder │
//!               └──────────┘  └─────────┘  └───────────┘
//! ```

pub mod bus;
pub mod directory;
pub mod generator;
pub mod handshake;
pub mod hub;
pub mod id;
pub mod metrics;
pub mod node;
pub mod presence;
pub mod router;
pub mod session;
pub mod store;

pub use bus::{Bus, BusError, MemoryBus};
pub use directory::{
    ContactDirectory, DirectoryError, GroupDirectory, MemoryDirectory, UserId, UserProfile,
};
pub use generator::{DisabledGenerator, GenerationError, TextGenerator};
pub use handshake::{AuthError, MemoryOtpStore, OtpVerifier};
pub use hub::{forward_from_bus, BusForwarder, Hub, HubConfig, HubError, HubHandle, SessionId};
pub use id::IdGenerator;
pub use node::NodeId;
pub use presence::{MemoryPresenceStore, PresenceError, PresenceStore};
pub use router::{ChatError, Delivery, Location, Router, RouterConfig, Services};
pub use session::{
    CloseReason, ConnectionState, Dispatcher, Session, SessionConfig, SessionOutcome,
};
pub use store::{MemoryMessageStore, MessageStore, StoreError};
