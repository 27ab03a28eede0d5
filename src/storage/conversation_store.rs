//! `ConversationStore` — loads conversation state on first reference in an
//! instance.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::conversation::Conversation;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation store unavailable")]
    Unavailable,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError>;
}

/// Process-local store. A real deployment backs this with its own graph or
/// relational store; the core only ever calls through this trait.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.lock().await.get(conversation_id).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.conversations.lock().await.insert(conversation.conversation_id.clone(), conversation.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_conversation() {
        let store = InMemoryConversationStore::new();
        let convo = Conversation::new("c1", "o1");
        store.save(&convo).await.unwrap();
        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.conversation_id, "c1");
    }

    #[tokio::test]
    async fn missing_conversation_returns_none() {
        let store = InMemoryConversationStore::new();
        assert!(store.load("missing").await.unwrap().is_none());
    }
}
