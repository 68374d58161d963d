use crate::stats::VaultSummary;
use std::sync::{Arc, Mutex, MutexGuard};

/// One full scan's result set. Immutable once published; `block` is the fork
/// pin every vault in the batch was measured at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBatch {
    pub block: u64,
    pub summaries: Vec<VaultSummary>,
}

struct SlotState {
    latest: Option<ScanBatch>,
    published: u64,
    displaced: u64,
}

struct SlotInner {
    state: Mutex<SlotState>,
}

fn lock_state<'a>(inner: &'a SlotInner, label: &str) -> MutexGuard<'a, SlotState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("[REPORT] batch slot lock poisoned in {}; recovering.", label);
            poisoned.into_inner()
        }
    }
}

/// Single-slot mailbox with keep-newest semantics: the producer overwrites,
/// the consumer takes-and-clears. The slot holds at most one batch, so a
/// starved consumer never accumulates backlog; superseded batches are
/// dropped unread (and counted).
pub struct BatchSlot;

#[derive(Clone)]
pub struct BatchPublisher {
    inner: Arc<SlotInner>,
}

pub struct BatchConsumer {
    inner: Arc<SlotInner>,
}

impl BatchSlot {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (BatchPublisher, BatchConsumer) {
        let inner = Arc::new(SlotInner {
            state: Mutex::new(SlotState {
                latest: None,
                published: 0,
                displaced: 0,
            }),
        });
        (
            BatchPublisher {
                inner: Arc::clone(&inner),
            },
            BatchConsumer { inner },
        )
    }
}

impl BatchPublisher {
    /// Publish a completed batch, superseding any unconsumed one. Returns
    /// `true` if an unconsumed batch was displaced.
    pub fn publish(&self, batch: ScanBatch) -> bool {
        let mut state = lock_state(&self.inner, "BatchPublisher::publish");
        state.published = state.published.saturating_add(1);
        let displaced = state.latest.replace(batch).is_some();
        if displaced {
            state.displaced = state.displaced.saturating_add(1);
            let total = state.displaced;
            drop(state);
            tracing::warn!(
                "[REPORT] unconsumed scan batch superseded before reporting ({} dropped so far)",
                total
            );
        }
        displaced
    }
}

impl BatchConsumer {
    /// Drain: atomically remove and return the newest batch, leaving the
    /// slot empty. A publish racing this call lands after it completes and
    /// survives for the next take.
    pub fn take(&self) -> Option<ScanBatch> {
        lock_state(&self.inner, "BatchConsumer::take").latest.take()
    }

    pub fn is_empty(&self) -> bool {
        lock_state(&self.inner, "BatchConsumer::is_empty")
            .latest
            .is_none()
    }
}
