use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SyncResult;
use crate::models::{IngestOutcome, IngestRequest, RunSummary};
use crate::services::processor::process_invoice;
use crate::services::state::SyncSession;

/// Cooperative cancellation flag, checked between queue items.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Feeds documents through the pipeline one at a time, pausing between items so the
/// extraction quota is not burst.
pub struct IngestQueue {
    delay: Duration,
    abort: AbortHandle,
    started: AtomicBool,
}

impl IngestQueue {
    pub fn new(delay: Duration, abort: AbortHandle) -> Self {
        Self {
            delay,
            abort,
            started: AtomicBool::new(false),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Processes one item, or returns `None` once the queue has been aborted.
    pub async fn process(
        &self,
        session: &SyncSession,
        request: IngestRequest,
    ) -> Option<SyncResult<IngestOutcome>> {
        if self.is_aborted() {
            return None;
        }
        if self.started.swap(true, Ordering::SeqCst) && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
            if self.is_aborted() {
                return None;
            }
        }
        Some(process_invoice(session, request).await)
    }

    /// Processes items in order until done or aborted. Results line up with the input prefix.
    pub async fn run(
        &self,
        session: &SyncSession,
        requests: Vec<IngestRequest>,
    ) -> Vec<SyncResult<IngestOutcome>> {
        let total = requests.len();
        let mut results = Vec::with_capacity(total);
        for request in requests {
            match self.process(session, request).await {
                Some(result) => results.push(result),
                None => {
                    tracing::warn!(done = results.len(), total, "Ingestion queue aborted");
                    break;
                }
            }
        }
        results
    }
}

pub fn tally(summary: &mut RunSummary, result: &SyncResult<IngestOutcome>) {
    match result {
        Ok(IngestOutcome::Processed { .. }) => summary.processed += 1,
        Ok(IngestOutcome::Duplicate { .. }) => summary.duplicates += 1,
        Err(_) => summary.errors += 1,
    }
}
