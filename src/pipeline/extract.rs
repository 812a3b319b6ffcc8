//! Part extraction: flattens a MIME part tree into one plain-text body
//! and an ordered attachment list.
//!
//! Text candidates are overwritten as the walk proceeds, so the **last**
//! `text/plain` and the **last** `text/html` leaf in pre-order win.

use tracing::warn;

use crate::error::ExtractionError;
use crate::pipeline::types::{AttachmentMeta, MimeLeaf, MimePartNode};

/// Turns HTML into plain text.
pub trait HtmlRenderer: Send + Sync {
    fn render(&self, html: &str, wrap_width: usize) -> Result<String, ExtractionError>;
}

/// Renderer backed by the `html2text` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Html2TextRenderer;

impl HtmlRenderer for Html2TextRenderer {
    fn render(&self, html: &str, wrap_width: usize) -> Result<String, ExtractionError> {
        html2text::from_read(html.as_bytes(), wrap_width.max(1))
            .map_err(|e| ExtractionError::Render(e.to_string()))
    }
}

/// Body and attachments pulled out of a part tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedParts {
    pub body: String,
    pub attachments: Vec<AttachmentMeta>,
}

/// Flattens part trees using an HTML renderer.
pub struct PartExtractor<R = Html2TextRenderer> {
    renderer: R,
    wrap_width: usize,
}

impl PartExtractor<Html2TextRenderer> {
    pub fn new(wrap_width: usize) -> Self {
        Self::with_renderer(Html2TextRenderer, wrap_width)
    }
}

impl<R: HtmlRenderer> PartExtractor<R> {
    pub fn with_renderer(renderer: R, wrap_width: usize) -> Self {
        Self {
            renderer,
            wrap_width,
        }
    }

    /// Walk `parts` depth-first and build the body and attachment list.
    ///
    /// Never fails: a leaf without a body contributes nothing, and a renderer
    /// failure falls back to the plain-text candidate.
    pub fn extract(&self, parts: &[MimePartNode]) -> ExtractedParts {
        let mut walk = Walk::default();
        // Explicit stack: store-supplied trees have no depth limit.
        let mut pending: Vec<&MimePartNode> = parts.iter().rev().collect();
        while let Some(node) = pending.pop() {
            match node {
                MimePartNode::Multipart { parts } => pending.extend(parts.iter().rev()),
                MimePartNode::Leaf(leaf) => walk.visit_leaf(leaf),
            }
        }

        let body = match walk.html.as_deref() {
            Some(html) if !html.is_empty() => match self.renderer.render(html, self.wrap_width) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "HTML body could not be rendered, using plain-text part");
                    walk.text.unwrap_or_default()
                }
            },
            _ => walk.text.unwrap_or_default(),
        };

        ExtractedParts {
            body,
            attachments: walk.attachments,
        }
    }
}

#[derive(Default)]
struct Walk {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<AttachmentMeta>,
}

impl Walk {
    fn visit_leaf(&mut self, leaf: &MimeLeaf) {
        let mime = essence(&leaf.content_type);

        if !leaf.is_attachment && mime == "text/plain" {
            self.text = Some(leaf.body.clone().unwrap_or_default());
        } else if !leaf.is_attachment && mime == "text/html" {
            self.html = Some(leaf.body.clone().unwrap_or_default());
        } else if leaf.is_attachment || leaf.name.as_deref().is_some_and(|n| !n.is_empty()) {
            self.attachments.push(AttachmentMeta {
                name: leaf.name.clone(),
                mime_type: leaf.content_type.clone(),
                size: leaf.size,
            });
        }
    }
}

/// `Text/HTML; charset=utf-8` → `text/html`.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
