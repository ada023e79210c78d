//! Message persistence.

use crate::directory::UserId;
use async_trait::async_trait;
use parley_protocol::MessageId;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// A stored private message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateRecord {
    pub message_id: MessageId,
    pub sender: UserId,
    pub recipient: UserId,
    pub content: String,
    pub created_at: u64,
}

/// A stored group message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub message_id: MessageId,
    pub group: String,
    /// User who wrote the message, or who prompted the bot for a bot answer.
    pub author: UserId,
    pub from_bot: bool,
    pub content: String,
    pub created_at: u64,
}

/// Message store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Message store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only chat history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_private(&self, record: PrivateRecord) -> Result<(), StoreError>;

    async fn append_group(&self, record: GroupRecord) -> Result<(), StoreError>;
}

/// In-process message store.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    private: Mutex<Vec<PrivateRecord>>,
    group: Mutex<Vec<GroupRecord>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored private message, oldest first.
    #[must_use]
    pub fn private_messages(&self) -> Vec<PrivateRecord> {
        self.private
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Copy of every stored group message, oldest first.
    #[must_use]
    pub fn group_messages(&self) -> Vec<GroupRecord> {
        self.group
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append_private(&self, record: PrivateRecord) -> Result<(), StoreError> {
        self.private
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    async fn append_group(&self, record: GroupRecord) -> Result<(), StoreError> {
        self.group
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}
