//! Run-wide interruption flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared stop flag, set once from the Ctrl-C handler and observed by every
/// sandbox wait. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::warn!("Interrupt received, stopping active sandboxes...");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set (used in `select!`).
    pub async fn wait(&self) {
        while !self.is_triggered() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
