//! `MailStore` trait: the mail client's message and tag APIs.
//!
//! The pipeline only needs a full-message fetch, a tag read, the tag
//! registry and a tag write. Everything else about the store is opaque.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::pipeline::tags::TagDefinition;
use crate::pipeline::types::{FullMessage, TagSet};

/// Backend-agnostic access to messages and their tags.
#[async_trait]
pub trait MailStore: Send + Sync {
    // ── Messages ────────────────────────────────────────────────────

    /// Fetch a message's headers and part tree.
    async fn get_full(&self, id: &str) -> Result<FullMessage, StoreError>;

    /// Tags currently on a message.
    async fn get_tags(&self, id: &str) -> Result<TagSet, StoreError>;

    /// Replace a message's tags with `tags`.
    async fn update_tags(&self, id: &str, tags: &TagSet) -> Result<(), StoreError>;

    // ── Tag registry ────────────────────────────────────────────────

    /// All tags the store knows about.
    async fn list_tags(&self) -> Result<Vec<TagDefinition>, StoreError>;

    /// Register a new tag.
    async fn create_tag(&self, tag: &TagDefinition) -> Result<(), StoreError>;
}
