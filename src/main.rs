use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use mail_tagger::config::TaggerConfig;
use mail_tagger::error::Result;
use mail_tagger::llm::create_classifier;
use mail_tagger::mime;
use mail_tagger::pipeline::listener::spawn_batch_listener;
use mail_tagger::pipeline::processor::MessageProcessor;
use mail_tagger::pipeline::tags::TagRules;
use mail_tagger::pipeline::types::{Folder, NewMailBatch};
use mail_tagger::store::MemoryMailStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("Usage: mail-tagger <message.eml>...");
        std::process::exit(2);
    }

    let config = TaggerConfig::from_env()?;

    eprintln!("📬 Mail Tagger v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Endpoint: {}", config.endpoint);
    eprintln!("   Model: {}", config.model);
    eprintln!("   Prompt budget: {} chars", config.char_budget());
    eprintln!("   Messages: {}\n", paths.len());

    let rules = TagRules::standard()?;
    let classifier = create_classifier(&config)?;

    // ── Load messages ────────────────────────────────────────────────────
    let store = Arc::new(MemoryMailStore::new());
    for path in &paths {
        match mime::load_file(path).await {
            Ok(message) => store.insert(path, message).await,
            Err(e) => warn!(path = %path, error = %e, "Skipping unreadable message"),
        }
    }
    let message_ids = store.ids().await;

    let processor = Arc::new(MessageProcessor::new(
        store.clone(),
        classifier,
        rules,
        &config,
    ));

    if let Err(e) = processor.ensure_tags_exist().await {
        warn!(error = %e, "Could not verify managed tags");
    }

    // ── Run one batch through the listener ───────────────────────────────
    let (tx, rx) = mpsc::channel(1);
    let (handle, _shutdown) = spawn_batch_listener(rx, Arc::clone(&processor));

    let batch = NewMailBatch {
        folder: Folder {
            name: "Local".to_string(),
            path: "local".to_string(),
        },
        message_ids,
    };
    if tx.send(batch).await.is_err() {
        warn!("Batch listener stopped before the batch was delivered");
    }
    drop(tx);

    let reports = handle.await?;
    for report in &reports {
        for (id, outcome) in &report.outcomes {
            info!(id = %id, outcome = outcome.label(), "Message finished");
        }
        println!("{}", serde_json::to_string_pretty(report)?);
    }

    info!("Done");
    Ok(())
}
