// Disk discovery and privileged write access
//
// All device access goes through a `DiskService`, a system service that hands out
// write-capable descriptors, so the installer itself never needs to run as root.
// On Linux this is UDisks2 over the system bus.

use crate::models::Disk;
use anyhow::{Context, Result};
use std::future::Future;
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
mod linux;

mod poller;
mod sink;

#[cfg(test)]
pub(crate) mod fake;

#[cfg(target_os = "linux")]
pub use linux::UDisks2Service;
pub use poller::{DEFAULT_POLL_INTERVAL, DiskPoller};
pub use sink::{BlockWriter, DiskSink};

/// Boolean device attributes used to decide whether a device is an install target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolProperty {
    Partition,
    ReadOnly,
    /// Cleartext device of an unlocked encrypted volume
    EncryptedOverlay,
    Loopback,
    SoftwareRaidMember,
    OpticalDisk,
    /// Marked by the system as internal / not for the user to touch
    SystemInternal,
    /// Whether the block device belongs to a physical drive
    Drive,
}

impl BoolProperty {
    /// A device with any of these set is never offered as a target
    pub const EXCLUSIONS: [BoolProperty; 7] = [
        BoolProperty::Partition,
        BoolProperty::ReadOnly,
        BoolProperty::EncryptedOverlay,
        BoolProperty::Loopback,
        BoolProperty::SoftwareRaidMember,
        BoolProperty::OpticalDisk,
        BoolProperty::SystemInternal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BoolProperty::Partition => "Partition",
            BoolProperty::ReadOnly => "ReadOnly",
            BoolProperty::EncryptedOverlay => "EncryptedOverlay",
            BoolProperty::Loopback => "Loopback",
            BoolProperty::SoftwareRaidMember => "SoftwareRaidMember",
            BoolProperty::OpticalDisk => "OpticalDisk",
            BoolProperty::SystemInternal => "SystemInternal",
            BoolProperty::Drive => "Drive",
        }
    }
}

impl std::fmt::Display for BoolProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringProperty {
    Model,
    DeviceFile,
}

impl std::fmt::Display for StringProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StringProperty::Model => write!(f, "Model"),
            StringProperty::DeviceFile => write!(f, "DeviceFile"),
        }
    }
}

/// A system service that enumerates block devices and grants write access to them.
///
/// Property accessors are typed: implementations convert whatever the service
/// returns exactly once, and report a mismatch as an error for that device.
pub trait DiskService: Send + Sync + 'static {
    type Writer: BlockWriter;

    /// Identifiers of every block device the service knows about
    fn block_devices(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn bool_property(
        &self,
        device: &str,
        property: BoolProperty,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn string_property(
        &self,
        device: &str,
        property: StringProperty,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Size of the device in bytes
    fn size(&self, device: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Ask the service for a write-only descriptor on the device
    fn open_for_write(&self, disk: &Disk) -> impl Future<Output = Result<Self::Writer>> + Send;
}

/// Lists the devices eligible as install targets.
///
/// Fails only when the service itself cannot be queried. A device whose
/// attributes cannot be read is logged and skipped. The result keeps the
/// service's order; use [`sort_disks`] for display.
pub async fn list_disks<S: DiskService>(service: &S) -> Result<Vec<Disk>> {
    let devices = service
        .block_devices()
        .await
        .context("Failed to list block devices")?;
    debug!("Disk service reported {} block devices", devices.len());

    let mut disks = Vec::with_capacity(devices.len());
    for device in devices {
        match probe_device(service, &device).await {
            Ok(Some(disk)) => {
                debug!("Found disk: {}", disk);
                disks.push(disk);
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping device {}: {:#}", device, e),
        }
    }

    info!("Found {} eligible disks", disks.len());
    Ok(disks)
}

async fn probe_device<S: DiskService>(service: &S, device: &str) -> Result<Option<Disk>> {
    for property in BoolProperty::EXCLUSIONS {
        let set = service
            .bool_property(device, property)
            .await
            .with_context(|| format!("Failed to read {}", property))?;
        if set {
            debug!("Excluding {}: {} is set", device, property);
            return Ok(None);
        }
    }

    let is_drive = service
        .bool_property(device, BoolProperty::Drive)
        .await
        .context("Failed to read Drive")?;
    if !is_drive {
        debug!("Excluding {}: not a drive", device);
        return Ok(None);
    }

    let name = service
        .string_property(device, StringProperty::Model)
        .await
        .context("Failed to read Model")?;
    let size = service.size(device).await.context("Failed to read size")?;
    let device_file = service
        .string_property(device, StringProperty::DeviceFile)
        .await
        .context("Failed to read DeviceFile")?;

    Ok(Some(Disk {
        id: device.to_string(),
        name,
        device_file,
        size,
    }))
}

/// Sorts by name, ignoring case
pub fn sort_disks(disks: &mut [Disk]) {
    disks.sort_by_cached_key(|d| d.name.to_lowercase());
}

/// Keeps only disks large enough to receive `required` bytes
pub fn filter_by_size(disks: Vec<Disk>, required: u64) -> Vec<Disk> {
    disks
        .into_iter()
        .filter(|d| {
            let fits = d.fits(required);
            if !fits {
                debug!("Hiding {}: smaller than {} bytes", d, required);
            }
            fits
        })
        .collect()
}
