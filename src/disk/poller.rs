use super::{DiskService, filter_by_size, list_disks, sort_disks};
use crate::models::Disk;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Keeps an up to date list of install targets.
///
/// The list is refreshed in the background, replaced wholesale on every poll,
/// sorted by name and restricted to disks of at least `min_size` bytes. An
/// unreachable disk service is logged and published as an empty list.
pub struct DiskPoller {
    snapshot: watch::Receiver<Vec<Disk>>,
    task: JoinHandle<()>,
}

impl DiskPoller {
    pub fn spawn<S: DiskService>(service: Arc<S>, min_size: u64, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(Vec::new());

        let task = tokio::spawn(async move {
            loop {
                let disks = poll_once(service.as_ref(), min_size).await;
                let changed = tx.send_if_modified(|current| {
                    if *current == disks {
                        false
                    } else {
                        *current = disks;
                        true
                    }
                });
                if changed {
                    debug!("Disk list changed");
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        });

        Self { snapshot: rx, task }
    }

    /// The most recently published list
    pub fn snapshot(&self) -> Vec<Disk> {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified whenever the list changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<Disk>> {
        self.snapshot.clone()
    }

    /// Whether a previously selected disk is still present
    pub fn contains(&self, id: &str) -> bool {
        self.snapshot.borrow().iter().any(|d| d.id == id)
    }

    pub fn find(&self, id: &str) -> Option<Disk> {
        self.snapshot.borrow().iter().find(|d| d.id == id).cloned()
    }
}

impl Drop for DiskPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_once<S: DiskService>(service: &S, min_size: u64) -> Vec<Disk> {
    match list_disks(service).await {
        Ok(disks) => {
            let mut disks = filter_by_size(disks, min_size);
            sort_disks(&mut disks);
            disks
        }
        Err(e) => {
            error!("Cannot get list of disks: {:#}", e);
            Vec::new()
        }
    }
}
