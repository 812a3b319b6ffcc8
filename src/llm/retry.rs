//! Retry wrapper for classifiers.
//!
//! Only transport failures and non-success statuses are retried; a model
//! answer that does not parse is returned as-is. The default policy makes a
//! single attempt.

use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::ClassificationError;
use crate::llm::Classifier;
use crate::pipeline::types::ClassificationResult;

/// Retries the inner classifier with exponential backoff.
pub struct RetryingClassifier<C> {
    inner: C,
    policy: RetryConfig,
}

impl<C: Classifier> RetryingClassifier<C> {
    pub fn new(inner: C, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: Classifier> Classifier for RetryingClassifier<C> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn classify(&self, prompt: &str) -> Result<ClassificationResult, ClassificationError> {
        let started = Instant::now();
        let mut retries = 0u32;
        let mut delay = self.policy.backoff;

        loop {
            match self.inner.classify(prompt).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && retries < self.policy.max_retries => {
                    retries += 1;
                    warn!(
                        attempt = retries,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Classification failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) if retries > 0 && e.is_retryable() => {
                    return Err(ClassificationError::RetriesExhausted {
                        attempts: retries + 1,
                        elapsed: started.elapsed(),
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    /// Classifier that replays a script of results and counts calls.
    struct Scripted {
        calls: AtomicU32,
        script: Mutex<Vec<Result<ClassificationResult, ClassificationError>>>,
    }

    impl Scripted {
        fn new(mut script: Vec<Result<ClassificationResult, ClassificationError>>) -> Self {
            script.reverse();
            Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl Classifier for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn classify(
            &self,
            _prompt: &str,
        ) -> Result<ClassificationResult, ClassificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(unavailable()))
        }
    }

    fn unavailable() -> ClassificationError {
        ClassificationError::Status {
            status: 503,
            body: "loading model".into(),
        }
    }

    fn policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn default_policy_is_single_attempt() {
        let retrying = RetryingClassifier::new(Scripted::new(vec![]), RetryConfig::default());
        let err = retrying.classify("p").await.unwrap_err();
        assert!(matches!(err, ClassificationError::Status { status: 503, .. }));
        assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let retrying = RetryingClassifier::new(
            Scripted::new(vec![
                Err(unavailable()),
                Err(unavailable()),
                Ok(ClassificationResult {
                    is_scam: true,
                    ..Default::default()
                }),
            ]),
            policy(3),
        );
        let result = retrying.classify("p").await.unwrap();
        assert!(result.is_scam);
        assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let retrying = RetryingClassifier::new(Scripted::new(vec![]), policy(2));
        let err = retrying.classify("p").await.unwrap_err();
        match err {
            ClassificationError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ClassificationError::Status { .. }));
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn payload_errors_are_not_retried() {
        let retrying = RetryingClassifier::new(
            Scripted::new(vec![Err(ClassificationError::Payload("not json".into()))]),
            policy(5),
        );
        let err = retrying.classify("p").await.unwrap_err();
        assert!(matches!(err, ClassificationError::Payload(_)));
        assert_eq!(retrying.inner().calls.load(Ordering::SeqCst), 1);
    }
}
