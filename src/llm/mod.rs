//! Classification client for the local inference endpoint.
//!
//! `Classifier` is the seam the pipeline talks to. `OllamaClient` is the
//! HTTP implementation; `RetryingClassifier` wraps any classifier with a
//! retry policy (zero retries unless configured).

pub mod ollama;
pub mod retry;

pub use ollama::{OllamaClient, parse_classification};
pub use retry::RetryingClassifier;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TaggerConfig;
use crate::error::ClassificationError;
use crate::pipeline::types::ClassificationResult;

/// Something that can classify a prompt.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Model identifier, for logging.
    fn model_name(&self) -> &str;

    /// Run one classification. Never panics on bad input or bad output.
    async fn classify(&self, prompt: &str) -> Result<ClassificationResult, ClassificationError>;
}

/// Build the configured classifier: Ollama over HTTP, wrapped in the retry policy.
pub fn create_classifier(config: &TaggerConfig) -> Result<Arc<dyn Classifier>, ClassificationError> {
    let client = OllamaClient::new(&config.endpoint, &config.model, config.request_timeout)?;
    tracing::info!(
        endpoint = %config.endpoint,
        model = %config.model,
        max_retries = config.retry.max_retries,
        "Using Ollama classifier"
    );
    Ok(Arc::new(RetryingClassifier::new(client, config.retry)))
}
