//! In-memory mail store, used by the CLI and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::pipeline::tags::TagDefinition;
use crate::pipeline::types::{FullMessage, TagSet};
use crate::store::traits::MailStore;

struct StoredMessage {
    message: FullMessage,
    tags: TagSet,
}

/// Messages and tag registry held in memory.
#[derive(Default)]
pub struct MemoryMailStore {
    messages: RwLock<HashMap<String, StoredMessage>>,
    registry: RwLock<Vec<TagDefinition>>,
}

impl MemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a message with no tags.
    pub async fn insert(&self, id: &str, message: FullMessage) {
        self.insert_with_tags(id, message, TagSet::new()).await;
    }

    /// Add (or replace) a message carrying `tags`.
    pub async fn insert_with_tags(&self, id: &str, message: FullMessage, tags: TagSet) {
        let mut messages = self.messages.write().await;
        messages.insert(id.to_string(), StoredMessage { message, tags });
    }

    /// Message ids currently stored, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let messages = self.messages.read().await;
        let mut ids: Vec<String> = messages.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl MailStore for MemoryMailStore {
    async fn get_full(&self, id: &str) -> Result<FullMessage, StoreError> {
        let messages = self.messages.read().await;
        messages
            .get(id)
            .map(|m| m.message.clone())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn get_tags(&self, id: &str) -> Result<TagSet, StoreError> {
        let messages = self.messages.read().await;
        messages
            .get(id)
            .map(|m| m.tags.clone())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn update_tags(&self, id: &str, tags: &TagSet) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let stored = messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        stored.tags = tags.clone();
        debug!(id = %id, tags = ?tags, "Tags updated");
        Ok(())
    }

    async fn list_tags(&self) -> Result<Vec<TagDefinition>, StoreError> {
        Ok(self.registry.read().await.clone())
    }

    async fn create_tag(&self, tag: &TagDefinition) -> Result<(), StoreError> {
        let mut registry = self.registry.write().await;
        if registry.iter().any(|t| t.key == tag.key) {
            return Err(StoreError::Backend(format!("tag {} already exists", tag.key)));
        }
        registry.push(tag.clone());
        Ok(())
    }
}
