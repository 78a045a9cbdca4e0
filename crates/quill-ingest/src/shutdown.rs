//! Cooperative shutdown signal.
//!
//! A [`Shutdown`] is shared across the pipeline tasks: cheap to check
//! synchronously, and awaitable so a task blocked on I/O (a quiet gateway,
//! a backoff sleep, the age-flush ticker) can race its work against the
//! signal instead of noticing it only at the next loop iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown signal.
#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Create a new, untriggered signal.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Trigger shutdown. Idempotent; wakes every task blocked in
    /// [`wait`](Shutdown::wait).
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is triggered. Returns immediately if it already
    /// was.
    pub async fn wait(&self) {
        while !self.is_triggered() {
            let notified = self.notify.notified();
            // The flag may have flipped between the check and registering
            // the waiter; re-check before parking.
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
