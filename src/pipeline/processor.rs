//! Message processor: classifies new messages and merges tags into the store.
//!
//! Flow per message:
//! 1. Fetch headers and part tree from the store
//! 2. Flatten parts into a plain-text body and attachment list
//! 3. Build the budgeted prompt
//! 4. Classify (single attempt unless a retry policy wraps the classifier)
//! 5. Read existing tags, derive, write the union back
//!
//! Any failure skips that message only. Tags are never removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BatchParallelism, OverrunPolicy, TaggerConfig};
use crate::error::{PipelineError, StoreError};
use crate::llm::Classifier;
use crate::pipeline::extract::PartExtractor;
use crate::pipeline::prompt::PromptBuilder;
use crate::pipeline::tags::TagRules;
use crate::pipeline::types::{
    BatchReport, ClassificationResult, FullMessage, MessageOutcome, NewMailBatch,
    StructuredEmail, TagSet,
};
use crate::store::MailStore;

type MessageLock = Arc<tokio::sync::Mutex<()>>;

/// Runs the classification pipeline against a mail store.
pub struct MessageProcessor {
    store: Arc<dyn MailStore>,
    classifier: Arc<dyn Classifier>,
    extractor: PartExtractor,
    prompts: PromptBuilder,
    rules: TagRules,
    overrun_policy: OverrunPolicy,
    parallelism: BatchParallelism,
    /// Serializes read-derive-write per message id.
    message_locks: Mutex<HashMap<String, MessageLock>>,
}

impl MessageProcessor {
    /// Create a new message processor.
    pub fn new(
        store: Arc<dyn MailStore>,
        classifier: Arc<dyn Classifier>,
        rules: TagRules,
        config: &TaggerConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            extractor: PartExtractor::new(config.wrap_width),
            prompts: PromptBuilder::new(config.char_budget()),
            rules,
            overrun_policy: config.overrun_policy,
            parallelism: config.parallelism,
            message_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Override the prompt builder (custom template or budget).
    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Register any managed tag the store does not know yet.
    ///
    /// Returns how many tags were created. A single failed create is logged
    /// and does not stop the others.
    pub async fn ensure_tags_exist(&self) -> Result<usize, StoreError> {
        let existing = self.store.list_tags().await?;
        let mut created = 0;

        for tag in self.rules.definitions() {
            if existing.iter().any(|t| t.key == tag.key) {
                continue;
            }
            match self.store.create_tag(tag).await {
                Ok(()) => {
                    debug!(key = %tag.key, name = %tag.name, "Created tag");
                    created += 1;
                }
                Err(e) => warn!(key = %tag.key, error = %e, "Failed to create tag"),
            }
        }

        info!(created, "All managed tags are present");
        Ok(created)
    }

    /// Flatten a fetched message into what the prompt is built from.
    pub fn structure(&self, message: FullMessage) -> StructuredEmail {
        let extracted = self.extractor.extract(&message.parts);
        StructuredEmail {
            headers: message.headers,
            body: extracted.body,
            attachments: extracted.attachments,
        }
    }

    /// Process a single message through the full pipeline.
    pub async fn process(&self, id: &str) -> Result<MessageOutcome, PipelineError> {
        info!(id = %id, "Processing message");

        let message = self.store.get_full(id).await.map_err(PipelineError::Fetch)?;
        let email = self.structure(message);
        let prompt = self.prompts.build(&email);

        if let Some(overrun) = prompt.overrun.clone() {
            match self.overrun_policy {
                OverrunPolicy::Skip => return Err(overrun.into()),
                OverrunPolicy::Send => {
                    warn!(id = %id, error = %overrun, "Classifying hard-cut prompt");
                }
            }
        }
        if let Some(original_len) = prompt.body_truncated {
            debug!(id = %id, original_len, prompt_len = prompt.len(), "Body was truncated");
        }

        let result = self.classifier.classify(&prompt.text).await?;
        debug!(
            id = %id,
            model = self.classifier.model_name(),
            sender = %result.sender,
            sender_consistent = result.sender_consistent,
            "Message classified"
        );

        let lock = self.lock_for(id);
        let outcome = {
            let _guard = lock.lock().await;
            self.merge_tags(id, &result).await
        };
        self.release_lock(id, lock);

        let outcome = outcome?;
        if let MessageOutcome::Tagged { tags, added } = &outcome {
            info!(id = %id, tags = ?tags, added = ?added, "Applied analysis tags");
        }
        Ok(outcome)
    }

    async fn merge_tags(
        &self,
        id: &str,
        result: &ClassificationResult,
    ) -> Result<MessageOutcome, PipelineError> {
        let existing = self.store.get_tags(id).await.map_err(PipelineError::Fetch)?;
        let tags = self.rules.derive(result, &existing);
        let added: TagSet = tags.difference(&existing).cloned().collect();

        self.store
            .update_tags(id, &tags)
            .await
            .map_err(PipelineError::TagWrite)?;

        Ok(MessageOutcome::Tagged { tags, added })
    }

    /// Process every message of a batch. Failures are logged and recorded as
    /// skipped; the batch always runs to the end.
    pub async fn process_batch(&self, batch: &NewMailBatch) -> BatchReport {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let count = batch.message_ids.len();
        info!(
            batch_id = %batch_id,
            folder = %batch.folder.name,
            count,
            "Received new message(s)"
        );

        let outcomes: Vec<_> = futures::stream::iter(batch.message_ids.iter().cloned())
            .map(|id| async move {
                let outcome = self.process_isolated(&id).await;
                (id, outcome)
            })
            .buffered(self.parallelism.limit())
            .collect()
            .await;

        let report = BatchReport {
            batch_id,
            folder: batch.folder.name.clone(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };

        info!(
            batch_id = %batch_id,
            tagged = report.tagged_count(),
            skipped = report.skipped_count(),
            total = count,
            "Batch processing complete"
        );
        report
    }

    async fn process_isolated(&self, id: &str) -> MessageOutcome {
        match self.process(id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(id = %id, error = %e, "Skipping message");
                MessageOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn lock_for(&self, id: &str) -> MessageLock {
        let mut locks = self
            .message_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn release_lock(&self, id: &str, lock: MessageLock) {
        let mut locks = self
            .message_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Map entry plus ours: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::ClassificationError;
    use crate::pipeline::types::{Folder, Headers, MimePartNode, TriState};
    use crate::store::MemoryMailStore;

    /// Classifier returning a fixed answer; prompts containing `FAIL` error out.
    struct MockClassifier {
        answer: ClassificationResult,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl MockClassifier {
        fn new(answer: ClassificationResult) -> Self {
            Self {
                answer,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Classifier for MockClassifier {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn classify(&self, prompt: &str) -> Result<ClassificationResult, ClassificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if prompt.contains("FAIL") {
                return Err(ClassificationError::Status {
                    status: 500,
                    body: "model crashed".into(),
                });
            }
            Ok(self.answer.clone())
        }
    }

    fn message(from: &str, parts: Vec<MimePartNode>) -> FullMessage {
        let mut headers = Headers::new();
        headers.push("from", from);
        FullMessage { headers, parts }
    }

    fn processor(
        store: Arc<MemoryMailStore>,
        classifier: Arc<MockClassifier>,
        config: &TaggerConfig,
    ) -> MessageProcessor {
        MessageProcessor::new(store, classifier, TagRules::standard().unwrap(), config)
    }

    fn batch(ids: &[&str]) -> NewMailBatch {
        NewMailBatch {
            folder: Folder {
                name: "Inbox".into(),
                path: "/INBOX".into(),
            },
            message_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn set(keys: &[&str]) -> TagSet {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn html_advert_with_spf_failure() {
        let store = Arc::new(MemoryMailStore::new());
        store
            .insert(
                "1",
                message("a@b.com", vec![MimePartNode::text("text/html", "<p>Buy now!</p>")]),
            )
            .await;
        let classifier = Arc::new(MockClassifier::new(ClassificationResult {
            is_advertise: true,
            spf_pass: TriState::False,
            dkim_pass: TriState::Unknown,
            is_scam: false,
            ..Default::default()
        }));

        let processor = processor(store.clone(), classifier, &TaggerConfig::default());
        let outcome = processor.process("1").await.unwrap();

        let expected = set(&["adv", "spf-fail", "scam"]);
        assert_eq!(store.get_tags("1").await.unwrap(), expected);
        assert_eq!(
            outcome,
            MessageOutcome::Tagged {
                tags: expected.clone(),
                added: expected,
            }
        );
    }

    #[tokio::test]
    async fn structure_renders_html_body() {
        let store = Arc::new(MemoryMailStore::new());
        let classifier = Arc::new(MockClassifier::new(ClassificationResult::default()));
        let processor = processor(store, classifier, &TaggerConfig::default());

        let email = processor.structure(message(
            "a@b.com",
            vec![MimePartNode::multipart(vec![
                MimePartNode::text("text/plain", "plain version"),
                MimePartNode::text("text/html", "<p>Buy now!</p>"),
                MimePartNode::attachment("application/pdf", "offer.pdf", 999),
            ])],
        ));
        assert!(email.body.contains("Buy now!"));
        assert!(!email.body.contains("plain version"));
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.headers.get("from"), Some("a@b.com"));
    }

    #[tokio::test]
    async fn existing_tags_are_kept() {
        let store = Arc::new(MemoryMailStore::new());
        store
            .insert_with_tags(
                "1",
                message("x@y.com", vec![MimePartNode::text("text/plain", "hi")]),
                set(&["$label1", "adv"]),
            )
            .await;
        let classifier = Arc::new(MockClassifier::new(ClassificationResult {
            is_advertise: true,
            has_calendar_invite: true,
            ..Default::default()
        }));

        let processor = processor(store.clone(), classifier, &TaggerConfig::default());
        let outcome = processor.process("1").await.unwrap();

        assert_eq!(
            store.get_tags("1").await.unwrap(),
            set(&["$label1", "adv", "calendar"])
        );
        match outcome {
            MessageOutcome::Tagged { added, .. } => assert_eq!(added, set(&["calendar"])),
            other => panic!("Expected Tagged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn classification_failure_leaves_tags_untouched() {
        let store = Arc::new(MemoryMailStore::new());
        store
            .insert_with_tags(
                "1",
                message("x@y.com", vec![MimePartNode::text("text/plain", "FAIL")]),
                set(&["keep"]),
            )
            .await;
        let classifier = Arc::new(MockClassifier::new(ClassificationResult {
            is_scam: true,
            ..Default::default()
        }));

        let processor = processor(store.clone(), classifier, &TaggerConfig::default());
        let err = processor.process("1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Classification(_)));
        assert_eq!(store.get_tags("1").await.unwrap(), set(&["keep"]));
    }

    #[tokio::test]
    async fn batch_continues_after_failures() {
        let store = Arc::new(MemoryMailStore::new());
        store
            .insert("ok-1", message("a@x.com", vec![MimePartNode::text("text/plain", "hello")]))
            .await;
        store
            .insert("bad", message("b@x.com", vec![MimePartNode::text("text/plain", "FAIL")]))
            .await;
        store
            .insert("ok-2", message("c@x.com", vec![MimePartNode::text("text/plain", "hi")]))
            .await;
        let classifier = Arc::new(MockClassifier::new(ClassificationResult {
            is_personal_approach: true,
            ..Default::default()
        }));

        let processor = processor(store.clone(), classifier.clone(), &TaggerConfig::default());
        let report = processor
            .process_batch(&batch(&["ok-1", "missing", "bad", "ok-2"]))
            .await;

        assert_eq!(report.folder, "Inbox");
        assert_eq!(report.tagged_count(), 2);
        assert_eq!(report.skipped_count(), 2);
        let order: Vec<_> = report.outcomes.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["ok-1", "missing", "bad", "ok-2"]);
        assert!(matches!(
            report.outcome("missing"),
            Some(MessageOutcome::Skipped { .. })
        ));
        assert_eq!(store.get_tags("ok-2").await.unwrap(), set(&["personal"]));
        assert!(store.get_tags("bad").await.unwrap().is_empty());
        // The missing message never reached the classifier.
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sequential_by_default() {
        let store = Arc::new(MemoryMailStore::new());
        for id in ["1", "2", "3"] {
            store
                .insert(id, message("a@x.com", vec![MimePartNode::text("text/plain", id)]))
                .await;
        }
        let classifier = Arc::new(
            MockClassifier::new(ClassificationResult::default())
                .with_delay(Duration::from_millis(20)),
        );

        let processor = processor(store, classifier.clone(), &TaggerConfig::default());
        processor.process_batch(&batch(&["1", "2", "3"])).await;
        assert_eq!(classifier.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_parallelism_keeps_report_order() {
        let store = Arc::new(MemoryMailStore::new());
        let ids = ["1", "2", "3", "4", "5", "6"];
        for id in ids {
            store
                .insert(id, message("a@x.com", vec![MimePartNode::text("text/plain", id)]))
                .await;
        }
        let classifier = Arc::new(
            MockClassifier::new(ClassificationResult {
                is_service_important: true,
                ..Default::default()
            })
            .with_delay(Duration::from_millis(30)),
        );
        let config = TaggerConfig {
            parallelism: BatchParallelism::Bounded(3),
            ..TaggerConfig::default()
        };

        let processor = processor(store.clone(), classifier.clone(), &config);
        let report = processor.process_batch(&batch(&ids)).await;

        assert!(classifier.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(classifier.max_in_flight.load(Ordering::SeqCst) > 1);
        let order: Vec<_> = report.outcomes.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, ids);
        assert_eq!(report.tagged_count(), 6);
    }

    #[tokio::test]
    async fn duplicate_ids_in_one_batch_merge_safely() {
        let store = Arc::new(MemoryMailStore::new());
        store
            .insert("1", message("a@x.com", vec![MimePartNode::text("text/plain", "x")]))
            .await;
        let classifier = Arc::new(MockClassifier::new(ClassificationResult {
            is_business_approach: true,
            ..Default::default()
        }));
        let config = TaggerConfig {
            parallelism: BatchParallelism::Bounded(4),
            ..TaggerConfig::default()
        };

        let processor = processor(store.clone(), classifier, &config);
        let report = processor.process_batch(&batch(&["1", "1", "1"])).await;

        assert_eq!(report.tagged_count(), 3);
        assert_eq!(store.get_tags("1").await.unwrap(), set(&["business"]));
        assert!(processor.message_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overrun_skip_policy_skips_message() {
        let store = Arc::new(MemoryMailStore::new());
        store
            .insert("1", message("a@x.com", vec![MimePartNode::text("text/plain", "x")]))
            .await;
        let classifier = Arc::new(MockClassifier::new(ClassificationResult::default()));
        let config = TaggerConfig {
            overrun_policy: OverrunPolicy::Skip,
            ..TaggerConfig::default()
        };

        let processor = processor(store, classifier.clone(), &config)
            .with_prompt_builder(PromptBuilder::with_template("{headers}{body}{attachments}", 5));
        let err = processor.process("1").await.unwrap_err();
        assert!(matches!(err, PipelineError::BudgetOverrun(_)));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn overrun_send_policy_still_classifies() {
        let store = Arc::new(MemoryMailStore::new());
        store
            .insert("1", message("a@x.com", vec![MimePartNode::text("text/plain", "x")]))
            .await;
        let classifier = Arc::new(MockClassifier::new(ClassificationResult {
            is_scam: true,
            ..Default::default()
        }));

        let processor = processor(store.clone(), classifier.clone(), &TaggerConfig::default())
            .with_prompt_builder(PromptBuilder::with_template("{headers}{body}{attachments}", 5));
        processor.process("1").await.unwrap();
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_tags("1").await.unwrap(), set(&["scam"]));
    }

    #[tokio::test]
    async fn ensure_tags_exist_creates_missing_only() {
        let store = Arc::new(MemoryMailStore::new());
        store
            .create_tag(&crate::pipeline::tags::TagDefinition::new("scam", "Scam Alert", "#FF5722"))
            .await
            .unwrap();
        let classifier = Arc::new(MockClassifier::new(ClassificationResult::default()));
        let processor = processor(store.clone(), classifier, &TaggerConfig::default());

        assert_eq!(processor.ensure_tags_exist().await.unwrap(), 8);
        assert_eq!(processor.ensure_tags_exist().await.unwrap(), 0);

        let keys: TagSet = store
            .list_tags()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.key)
            .collect();
        assert_eq!(
            keys,
            set(&[
                "adv",
                "business",
                "personal",
                "important",
                "service-info",
                "scam",
                "calendar",
                "spf-fail",
                "dkim-fail"
            ])
        );
    }
}
