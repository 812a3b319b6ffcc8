//! Background batch listener.
//!
//! Receives `NewMailBatch` notifications from a channel and runs each batch
//! through the processor, one batch at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::pipeline::processor::MessageProcessor;
use crate::pipeline::types::{BatchReport, NewMailBatch};

/// Spawn the listener task.
///
/// The task stops when the sender side is dropped or when the returned flag
/// is set (checked before each batch). Returns a `JoinHandle` yielding every
/// report produced, and the shutdown flag.
pub fn spawn_batch_listener(
    mut rx: mpsc::Receiver<NewMailBatch>,
    processor: Arc<MessageProcessor>,
) -> (JoinHandle<Vec<BatchReport>>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Batch listener started");
        let mut reports = Vec::new();

        while let Some(batch) = rx.recv().await {
            if shutdown.load(Ordering::Relaxed) {
                info!("Batch listener shutting down");
                return reports;
            }
            reports.push(processor.process_batch(&batch).await);
        }

        info!("Batch channel closed, listener exiting");
        reports
    });

    (handle, shutdown_flag)
}
