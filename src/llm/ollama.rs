//! Ollama `/api/generate` client.
//!
//! One non-streaming request per prompt with `format: "json"`. The reply is
//! an envelope whose `response` field holds the model's JSON as a string, so
//! parsing happens twice: envelope first, then the embedded answer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClassificationError;
use crate::llm::Classifier;
use crate::pipeline::types::ClassificationResult;

/// Longest slice of an error body kept in `ClassificationError::Status`.
const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    format: &'static str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// HTTP client for a local Ollama server.
pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaClient {
    /// `timeout` of `None` leaves the request unbounded.
    pub fn new(
        endpoint: &str,
        model: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, ClassificationError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| ClassificationError::Transport {
                endpoint: endpoint.to_string(),
                reason: format!("Failed to create HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Classifier for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, prompt: &str) -> Result<ClassificationResult, ClassificationError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            format: "json",
            stream: false,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassificationError::Transport {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClassificationError::Transport {
                endpoint: self.endpoint.clone(),
                reason: format!("Failed to read response body: {e}"),
            })?;

        if !status.is_success() {
            return Err(ClassificationError::Status {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let envelope: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| ClassificationError::Envelope(e.to_string()))?;
        let raw = envelope
            .response
            .ok_or(ClassificationError::MissingResponse)?;

        debug!(model = %self.model, raw_response = %raw, "Classification response");
        parse_classification(&raw)
    }
}

/// Parse the model's embedded JSON answer.
pub fn parse_classification(raw: &str) -> Result<ClassificationResult, ClassificationError> {
    serde_json::from_str(raw.trim()).map_err(|e| ClassificationError::Payload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::TriState;

    #[test]
    fn request_body_shape() {
        let request = GenerateRequest {
            model: "gemma3:27b",
            prompt: "hello",
            format: "json",
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "gemma3:27b",
                "prompt": "hello",
                "format": "json",
                "stream": false
            })
        );
    }

    #[test]
    fn parse_valid_answer() {
        let result =
            parse_classification(r#" {"is_advertise": true, "spf_pass": false, "dkim_pass": null} "#)
                .unwrap();
        assert!(result.is_advertise);
        assert_eq!(result.spf_pass, TriState::False);
        assert_eq!(result.dkim_pass, TriState::Unknown);
    }

    #[test]
    fn parse_garbage_is_payload_error() {
        let err = parse_classification("Sure! Here is the JSON you asked for").unwrap_err();
        assert!(matches!(err, ClassificationError::Payload(_)));
    }

    #[test]
    fn parse_non_object_is_payload_error() {
        let err = parse_classification("42").unwrap_err();
        assert!(matches!(err, ClassificationError::Payload(_)));
    }

    #[test]
    fn envelope_without_response_field() {
        let envelope: GenerateResponse =
            serde_json::from_str(r#"{"model": "x", "done": true}"#).unwrap();
        assert!(envelope.response.is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let client =
            OllamaClient::new("http://127.0.0.1:9/api/generate", "m", Some(Duration::from_secs(2)))
                .unwrap();
        let err = client.classify("prompt").await.unwrap_err();
        assert!(matches!(err, ClassificationError::Transport { .. }));
    }
}
