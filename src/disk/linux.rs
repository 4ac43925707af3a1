// UDisks2 backed disk service

use super::{BoolProperty, DiskService, StringProperty};
use crate::models::Disk;
use anyhow::{Context, Result, anyhow};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::sync::Mutex;
use tracing::{debug, info};

use libc::{O_CLOEXEC, O_EXCL};
use udisks2::block::BlockProxy;
use udisks2::drive::DriveProxy;
use udisks2::zbus::fdo::ManagedObjects;
use udisks2::zbus::zvariant::OwnedObjectPath;
use udisks2::{Client, zbus};

/// Object path UDisks2 uses for "no object"
const NO_OBJECT: &str = "/";

const PARTITION_INTERFACE: &str = "org.freedesktop.UDisks2.Partition";
const LOOP_INTERFACE: &str = "org.freedesktop.UDisks2.Loop";

/// Interfaces implemented by each object, from one `GetManagedObjects` call
#[derive(Debug, Default)]
struct InterfaceIndex(HashMap<String, HashSet<String>>);

impl InterfaceIndex {
    fn from_managed(objects: ManagedObjects) -> Self {
        Self(
            objects
                .into_iter()
                .map(|(path, interfaces)| {
                    let names = interfaces.into_keys().map(|n| n.as_str().to_string()).collect();
                    (path.as_str().to_string(), names)
                })
                .collect(),
        )
    }

    fn has(&self, device: &str, interface: &str) -> Result<bool> {
        self.0
            .get(device)
            .map(|names| names.contains(interface))
            .ok_or_else(|| anyhow!("{} is not a known object", device))
    }
}

/// Proxies and interface snapshot of one listing pass
#[derive(Default)]
struct PassCache {
    interfaces: InterfaceIndex,
    blocks: HashMap<String, BlockProxy<'static>>,
    drives: HashMap<String, DriveProxy<'static>>,
}

/// Disk service talking to the UDisks2 daemon on the system bus.
///
/// Write access is granted by the daemon through `Block.OpenDevice`, which
/// passes back an open descriptor over the bus, so no elevated privileges are
/// needed in this process (polkit decides).
///
/// Every `block_devices` call takes one snapshot of the object tree and starts
/// a fresh proxy cache, so a listing pass costs a constant number of tree
/// fetches regardless of how many properties are read.
pub struct UDisks2Service {
    client: Client,
    connection: zbus::Connection,
    cache: Mutex<PassCache>,
}

impl UDisks2Service {
    /// Connect to the system bus.
    ///
    /// Fails when the bus or the UDisks2 daemon are not reachable.
    pub async fn connect() -> Result<Self> {
        let connection = zbus::Connection::system()
            .await
            .context("Failed to connect to the system bus")?;
        let client = Client::new_for_connection(connection.clone())
            .await
            .context("Failed to connect to UDisks2 on the system bus")?;
        Ok(Self {
            client,
            connection,
            cache: Mutex::new(PassCache::default()),
        })
    }

    fn object_path(device: &str) -> Result<OwnedObjectPath> {
        OwnedObjectPath::try_from(device.to_string())
            .with_context(|| format!("Invalid object path: {}", device))
    }

    fn with_cache<T>(&self, f: impl FnOnce(&mut PassCache) -> T) -> Result<T> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("UDisks2 cache lock poisoned"))?;
        Ok(f(&mut cache))
    }

    fn has_interface(&self, device: &str, interface: &str) -> Result<bool> {
        self.with_cache(|cache| cache.interfaces.has(device, interface))?
    }

    async fn block(&self, device: &str) -> Result<BlockProxy<'static>> {
        if let Some(block) = self.with_cache(|cache| cache.blocks.get(device).cloned())? {
            return Ok(block);
        }
        let block = BlockProxy::builder(&self.connection)
            .path(Self::object_path(device)?)?
            .build()
            .await
            .with_context(|| format!("{} is not a block device", device))?;
        self.with_cache(|cache| cache.blocks.insert(device.to_string(), block.clone()))?;
        Ok(block)
    }

    async fn drive_of(&self, block: &BlockProxy<'_>) -> Result<DriveProxy<'static>> {
        let drive_path = block.drive().await?;
        if drive_path.as_str() == NO_OBJECT {
            return Err(anyhow!("Block device has no drive"));
        }
        let key = drive_path.as_str().to_string();
        if let Some(drive) = self.with_cache(|cache| cache.drives.get(&key).cloned())? {
            return Ok(drive);
        }
        let drive = DriveProxy::builder(&self.connection)
            .path(drive_path)?
            .build()
            .await?;
        self.with_cache(|cache| cache.drives.insert(key, drive.clone()))?;
        Ok(drive)
    }

    /// Unmount all mounted filesystems on the disk itself and its partitions
    async fn umount_all(&self, disk: &str) -> Result<()> {
        debug!("Unmounting all filesystems on {}", disk);

        let block_devices = self
            .client
            .manager()
            .get_block_devices(HashMap::default())
            .await?;

        for dev_path in block_devices {
            let dev_name = dev_path.as_str().to_string();
            let object = self.client.object(dev_path)?;
            let table = match object.partition().await {
                Ok(partition) => Some(partition.table().await?.as_str().to_string()),
                Err(_) => None,
            };
            if !belongs_to(disk, &dev_name, table.as_deref()) {
                continue;
            }
            if let Ok(fs) = object.filesystem().await {
                if !fs.mount_points().await?.is_empty() {
                    info!("Unmounting filesystem on {}", dev_name);
                    fs.unmount(HashMap::new())
                        .await
                        .with_context(|| format!("Failed to unmount {}", dev_name))?;
                }
            }
        }

        Ok(())
    }
}

/// Whether `device` is `disk` or one of its partitions (`table` is the
/// partition's table object, if it is a partition)
fn belongs_to(disk: &str, device: &str, table: Option<&str>) -> bool {
    device == disk || table == Some(disk)
}

/// Decode a NUL terminated byte string property such as `PreferredDevice`
fn bytestring(raw: Vec<u8>) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn is_set(path: &OwnedObjectPath) -> bool {
    path.as_str() != NO_OBJECT
}

impl DiskService for UDisks2Service {
    type Writer = File;

    async fn block_devices(&self) -> Result<Vec<String>> {
        let objects = self
            .client
            .object_manager()
            .get_managed_objects()
            .await
            .context("Failed to read the UDisks2 object tree")?;
        let devices = self
            .client
            .manager()
            .get_block_devices(HashMap::default())
            .await?;

        self.with_cache(|cache| {
            *cache = PassCache {
                interfaces: InterfaceIndex::from_managed(objects),
                ..PassCache::default()
            }
        })?;
        Ok(devices.into_iter().map(|p| p.as_str().to_string()).collect())
    }

    async fn bool_property(&self, device: &str, property: BoolProperty) -> Result<bool> {
        let value = match property {
            // Optional interfaces: present or not
            BoolProperty::Partition => self.has_interface(device, PARTITION_INTERFACE)?,
            BoolProperty::Loopback => self.has_interface(device, LOOP_INTERFACE)?,
            BoolProperty::ReadOnly => self.block(device).await?.read_only().await?,
            BoolProperty::EncryptedOverlay => {
                is_set(&self.block(device).await?.crypto_backing_device().await?)
            }
            BoolProperty::SoftwareRaidMember => {
                is_set(&self.block(device).await?.mdraid_member().await?)
            }
            BoolProperty::SystemInternal => self.block(device).await?.hint_system().await?,
            BoolProperty::Drive => is_set(&self.block(device).await?.drive().await?),
            BoolProperty::OpticalDisk => {
                let block = self.block(device).await?;
                self.drive_of(&block).await?.optical().await?
            }
        };
        Ok(value)
    }

    async fn string_property(&self, device: &str, property: StringProperty) -> Result<String> {
        let block = self.block(device).await?;
        let value = match property {
            StringProperty::Model => self.drive_of(&block).await?.model().await?,
            StringProperty::DeviceFile => bytestring(block.preferred_device().await?),
        };
        Ok(value)
    }

    async fn size(&self, device: &str) -> Result<u64> {
        Ok(self.block(device).await?.size().await?)
    }

    async fn open_for_write(&self, disk: &Disk) -> Result<File> {
        info!("Opening {} for writing through UDisks2", disk);

        self.umount_all(&disk.id)
            .await
            .context("Failed to unmount partitions")?;

        let block = self.block(&disk.id).await?;

        // O_EXCL fails if anything else still holds the device open
        let flags = O_EXCL | O_CLOEXEC;
        let owned_fd = block
            .open_device(
                "w",
                [("flags", zbus::zvariant::Value::from(flags))]
                    .into_iter()
                    .collect(),
            )
            .await
            .with_context(|| format!("UDisks2 refused to open {}", disk.device_file))?;

        if let zbus::zvariant::Fd::Owned(owned_fd) = owned_fd.into() {
            debug!("Received write descriptor for {}", disk.device_file);
            Ok(File::from(owned_fd))
        } else {
            Err(anyhow!(
                "Failed to open device: UDisks2 did not provide an owned file descriptor"
            ))
        }
    }
}
