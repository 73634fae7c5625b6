use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Revocable token shared between whoever owns an utterance and the worker
/// producing audio for it.
///
/// Cancellation is one-way and sticky: once signalled, every clone observes it.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    flag: Arc<AtomicBool>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
