//! Message Storage
//!
//! Persistence is a collaborator: the session hands every delivered and
//! sent message to a [`MessageStore`] and only logs when the store fails.

use async_trait::async_trait;
use log::debug;
use std::collections::VecDeque;
use tokio::sync::RwLock;

use super::message_types::StoredMessage;
use crate::bluetooth::protocol::PeerId;
use crate::error::StoreError;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, message: &StoredMessage) -> Result<(), StoreError>;

    /// Most recent first; `peer` filters to messages it sent or received
    async fn query(&self, peer: Option<PeerId>, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;
}

/// Bounded ring buffer; the oldest message goes when full
pub struct InMemoryMessageStore {
    messages: RwLock<VecDeque<StoredMessage>>,
    max_messages: usize,
}

impl InMemoryMessageStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: RwLock::new(VecDeque::new()),
            max_messages: max_messages.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;

        if messages
            .iter()
            .any(|m| m.message_id == message.message_id && m.direction == message.direction)
        {
            debug!("Message already stored: {}", message.message_id);
            return Ok(());
        }

        messages.push_back(message.clone());
        while messages.len() > self.max_messages {
            if let Some(removed) = messages.pop_front() {
                debug!("Dropped oldest stored message {}", removed.message_id);
            }
        }
        Ok(())
    }

    async fn query(&self, peer: Option<PeerId>, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .rev()
            .filter(|m| peer.map_or(true, |p| m.involves(p)))
            .take(limit)
            .cloned()
            .collect())
    }
}
