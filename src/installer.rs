use crate::configuration::InstallConfig;
use crate::disk::{
    DEFAULT_POLL_INTERVAL, DiskPoller, DiskService, DiskSink, filter_by_size, list_disks, sort_disks,
};
use crate::error::InstallError;
use crate::image::{ImageManifest, ImageSource, VolumeIds, open_image};
use crate::install::install_holding;
use crate::models::{CancelToken, Disk, DiskSummary};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Entry point for presentation layers (GUI, prompts, batch).
///
/// Owns the disk service, the image and its manifest. Only one install runs
/// at a time; a second `run_install` while one is active fails with
/// [`InstallError::Busy`].
pub struct Installer<S: DiskService> {
    service: Arc<S>,
    image: Arc<dyn ImageSource>,
    manifest: ImageManifest,
    busy: Arc<AtomicBool>,
}

/// Marks an install as in flight for as long as it is alive.
///
/// Handed to the copy task once writing starts, so the flag stays set until
/// the last write has returned even if the caller gave up on the install.
struct SessionGuard(Arc<AtomicBool>);

impl SessionGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SessionGuard(Arc::clone(flag)))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S: DiskService> Installer<S> {
    pub fn new(service: Arc<S>, image: Arc<dyn ImageSource>, manifest: ImageManifest) -> Self {
        Self {
            service,
            image,
            manifest,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Whether an install is currently running
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Background poller listing only disks large enough for this image
    pub fn spawn_poller(&self) -> DiskPoller {
        DiskPoller::spawn(
            Arc::clone(&self.service),
            self.manifest.required_disk_size(),
            DEFAULT_POLL_INTERVAL,
        )
    }

    async fn eligible_disks(&self) -> Result<Vec<Disk>, InstallError> {
        let disks = list_disks(self.service.as_ref())
            .await
            .map_err(InstallError::ServiceUnavailable)?;
        let mut disks = filter_by_size(disks, self.manifest.required_disk_size());
        sort_disks(&mut disks);
        Ok(disks)
    }

    /// Disks the image can be installed to, sorted by name
    pub async fn list_install_targets(&self) -> Result<Vec<DiskSummary>, InstallError> {
        Ok(self
            .eligible_disks()
            .await?
            .iter()
            .map(Disk::summary)
            .collect())
    }

    /// Looks the disk up again right before writing, it may have been unplugged
    async fn find_disk(&self, disk_id: &str) -> Result<Disk, InstallError> {
        list_disks(self.service.as_ref())
            .await
            .map_err(InstallError::ServiceUnavailable)?
            .into_iter()
            .find(|d| d.id == disk_id)
            .ok_or_else(|| InstallError::DeviceNotFound(disk_id.to_string()))
    }

    /// Install the image and `config` on the disk identified by `disk_id`.
    ///
    /// Nothing touches the disk until it has been found again, checked to be
    /// large enough and the configuration has been serialized.
    pub async fn run_install<F>(
        &self,
        disk_id: &str,
        config: &InstallConfig,
        on_progress: F,
        cancel: &CancelToken,
    ) -> Result<(), InstallError>
    where
        F: FnMut(f64),
    {
        let session = SessionGuard::acquire(&self.busy).ok_or(InstallError::Busy)?;

        let disk = self.find_disk(disk_id).await?;
        let required = self.manifest.required_disk_size();
        if !disk.fits(required) {
            warn!("Refusing to install to {}: too small", disk);
            return Err(InstallError::TargetTooSmall {
                disk: disk.to_string(),
                size: disk.size,
                required,
            });
        }

        let archive = config
            .to_archive(self.manifest.config_size)
            .map_err(|e| InstallError::InvalidConfig(e.to_string()))?;

        let ids = self.manifest.uuid_patch.is_some().then(VolumeIds::random);
        let image = open_image(self.image.as_ref(), &self.manifest, ids)
            .map_err(|e| InstallError::Decompress(io::Error::other(format!("{:#}", e))))?;

        info!("Installing to {} as {}", disk, config.hostname());
        let writer = self
            .service
            .open_for_write(&disk)
            .await
            .map_err(InstallError::OpenDevice)?;
        debug!("Disk opened, starting copy");

        install_holding(
            DiskSink::new(writer),
            image,
            archive,
            self.manifest.image_size,
            cancel,
            on_progress,
            session,
        )
        .await
    }
}
