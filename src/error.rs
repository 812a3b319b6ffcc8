//! Error types for mail-tagger.

use std::time::Duration;

/// Top-level error type for the binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Tag rule error: {0}")]
    TagRule(#[from] TagRuleError),

    #[error("Batch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Failed to write report: {0}")]
    Report(#[from] serde_json::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mail store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Message not found: {id}")]
    NotFound { id: String },

    #[error("Store backend failed: {0}")]
    Backend(String),
}

/// Problems turning a message into a part tree or plain text.
///
/// Inside the extractor these degrade the body instead of aborting.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("HTML rendering failed: {0}")]
    Render(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The prompt frame alone does not fit the context budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Prompt frame of {frame_size} chars leaves no room in a {budget} char budget; prompt was hard-cut")]
pub struct BudgetOverrunError {
    pub frame_size: usize,
    pub budget: usize,
}

/// Inference endpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Request to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Inference endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response envelope: {0}")]
    Envelope(String),

    #[error("Response envelope has no \"response\" field")]
    MissingResponse,

    #[error("Model output is not a valid classification: {0}")]
    Payload(String),

    #[error("Gave up after {attempts} attempts ({elapsed:?}): {last}")]
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        last: Box<ClassificationError>,
    },
}

impl ClassificationError {
    /// Whether a retry policy may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Status { .. })
    }
}

/// Rule table problems. Raised when the table is built, never mid-message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagRuleError {
    #[error("No rule declared for flag {flag}")]
    MissingRule { flag: String },

    #[error("Flag {flag} has more than one rule")]
    DuplicateRule { flag: String },

    #[error("No tag registered for flag {flag}")]
    MissingTag { flag: String },

    #[error("Flag {flag} is registered with more than one tag")]
    DuplicateTag { flag: String },

    #[error("Tag key {key} is registered more than once")]
    DuplicateKey { key: String },
}

/// Per-message pipeline errors. Caught by the orchestrator; the batch continues.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(#[source] StoreError),

    #[error("Tag write failed: {0}")]
    TagWrite(#[source] StoreError),

    #[error("Budget overrun: {0}")]
    BudgetOverrun(#[from] BudgetOverrunError),

    #[error("Classification failed: {0}")]
    Classification(#[from] ClassificationError),
}

/// Result type alias for the tagger.
pub type Result<T> = std::result::Result<T, Error>;
