use crate::utils::format_size;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A block device as reported by the disk service at enumeration time.
///
/// Snapshots are never mutated; every poll produces a fresh list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    /// Opaque identifier used by the disk service (a UDisks2 object path on Linux)
    pub id: String,
    /// Drive model as reported by the service
    pub name: String,
    /// Device node, e.g. "/dev/sdb"
    pub device_file: String,
    /// Size in bytes
    pub size: u64,
}

impl Disk {
    /// Whether the disk can hold `required` bytes
    pub fn fits(&self, required: u64) -> bool {
        self.size >= required
    }

    pub fn summary(&self) -> DiskSummary {
        DiskSummary {
            id: self.id.clone(),
            label: format!("{} {}", self.name, format_size(self.size)),
        }
    }
}

impl std::fmt::Display for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.name, format_size(self.size), self.device_file)
    }
}

/// What the presentation layer shows for an install target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSummary {
    pub id: String,
    pub label: String,
}

// A simple cancel token for aborting operations
#[derive(Debug, Clone)]
pub struct CancelToken {
    // Whether the operation should be cancelled
    cancelled: Arc<AtomicBool>,
    // Wakes tasks parked in `cancelled()`
    notify: Arc<Notify>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
