//! Shared types for the classification pipeline.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Mail-store message identifier.
pub type MessageId = String;

/// Set of tag keys attached to a message.
pub type TagSet = BTreeSet<String>;

// ── Part tree ───────────────────────────────────────────────────────

/// One node of a message's MIME part tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimePartNode {
    /// Container part (`multipart/*`) with its children in order.
    Multipart { parts: Vec<MimePartNode> },
    /// Content-bearing part.
    Leaf(MimeLeaf),
}

/// A content-bearing MIME part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeLeaf {
    /// Content type, possibly with parameters (`text/html; charset=utf-8`).
    pub content_type: String,
    /// Decoded text for text parts. `None` for binary parts.
    pub body: Option<String>,
    pub is_attachment: bool,
    pub name: Option<String>,
    /// Decoded size in bytes.
    pub size: u64,
}

impl MimePartNode {
    pub fn multipart(parts: Vec<MimePartNode>) -> Self {
        Self::Multipart { parts }
    }

    /// Inline text leaf.
    pub fn text(content_type: &str, body: &str) -> Self {
        Self::Leaf(MimeLeaf {
            content_type: content_type.to_string(),
            body: Some(body.to_string()),
            is_attachment: false,
            name: None,
            size: body.len() as u64,
        })
    }

    /// Attachment leaf without a decoded body.
    pub fn attachment(content_type: &str, name: &str, size: u64) -> Self {
        Self::Leaf(MimeLeaf {
            content_type: content_type.to_string(),
            body: None,
            is_attachment: true,
            name: Some(name.to_string()),
            size,
        })
    }
}

// ── Headers ─────────────────────────────────────────────────────────

/// Ordered header list. Duplicate names are kept in arrival order.
///
/// Serializes as a JSON object whose keys follow insertion order; a repeated
/// header name produces a repeated key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

// ── Structured email ────────────────────────────────────────────────

/// Attachment metadata as shown to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentMeta {
    pub name: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
}

/// Everything the prompt is built from.
#[derive(Debug, Clone, Default)]
pub struct StructuredEmail {
    pub headers: Headers,
    /// Plain-text body (rendered from HTML when the message had an HTML part).
    pub body: String,
    pub attachments: Vec<AttachmentMeta>,
}

/// A message as returned by the store's full fetch.
#[derive(Debug, Clone, Default)]
pub struct FullMessage {
    pub headers: Headers,
    pub parts: Vec<MimePartNode>,
}

// ── Classification result ───────────────────────────────────────────

/// Three-valued verification outcome.
///
/// `Unknown` means the model found no evidence either way; only `False`
/// counts as a failed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum TriState {
    True,
    False,
    #[default]
    Unknown,
}

impl TriState {
    pub fn is_false(self) -> bool {
        self == Self::False
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::True,
            Some(false) => Self::False,
            None => Self::Unknown,
        }
    }
}

impl From<TriState> for Option<bool> {
    fn from(value: TriState) -> Self {
        match value {
            TriState::True => Some(true),
            TriState::False => Some(false),
            TriState::Unknown => None,
        }
    }
}

/// The model's answer for one message.
///
/// Missing or `null` booleans read as `false`; missing or `null` tri-state
/// fields read as `Unknown`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationResult {
    #[serde(deserialize_with = "null_as_default")]
    pub sender: String,
    #[serde(deserialize_with = "null_as_default")]
    pub sender_consistent: bool,
    pub spf_pass: TriState,
    pub dkim_pass: TriState,
    #[serde(deserialize_with = "null_as_default")]
    pub is_advertise: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_business_approach: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_personal_approach: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_service_important: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_service_not_important: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_scam: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub has_calendar_invite: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ── Batches ─────────────────────────────────────────────────────────

/// Folder a batch of new mail arrived in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    pub path: String,
}

/// Notification that new messages arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMailBatch {
    pub folder: Folder,
    pub message_ids: Vec<MessageId>,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageOutcome {
    /// Tags were written. `added` holds the keys that were not there before.
    Tagged { tags: TagSet, added: TagSet },
    /// The message was left untouched.
    Skipped { reason: String },
}

impl MessageOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tagged { .. } => "tagged",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Summary of one processed batch. Outcomes keep delivery order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub folder: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<(MessageId, MessageOutcome)>,
}

impl BatchReport {
    pub fn tagged_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, MessageOutcome::Tagged { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes.len() - self.tagged_count()
    }

    /// Outcome for a given message id.
    pub fn outcome(&self, id: &str) -> Option<&MessageOutcome> {
        self.outcomes
            .iter()
            .find(|(mid, _)| mid == id)
            .map(|(_, o)| o)
    }
}
