// In-memory stand-ins for the disk service and block devices used by tests

use super::{BlockWriter, BoolProperty, DiskService, StringProperty};
use crate::models::Disk;
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct MemoryWriter {
    data: Arc<Mutex<Vec<u8>>>,
    synced: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    write_delay: Option<Duration>,
    fail_after: Option<usize>,
    fail_sync: bool,
    fail_close: bool,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every write, simulating a slow medium
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Fail every write once `limit` bytes have been accepted
    pub fn failing_after(mut self, limit: usize) -> Self {
        self.fail_after = Some(limit);
        self
    }

    pub fn failing_sync(mut self) -> Self {
        self.fail_sync = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        let mut data = self.data.lock().unwrap();
        if let Some(limit) = self.fail_after {
            if data.len() >= limit {
                return Err(io::Error::other("injected write failure"));
            }
        }
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlockWriter for MemoryWriter {
    fn sync(&mut self) -> io::Result<()> {
        if self.fail_sync {
            return Err(io::Error::other("injected sync failure"));
        }
        self.synced.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(io::Error::other("injected close failure"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeDevice {
    pub bools: HashMap<BoolProperty, bool>,
    pub model: Option<String>,
    pub size: Option<u64>,
    pub device_file: Option<String>,
}

impl FakeDevice {
    /// A removable drive passing every filter
    pub fn drive(model: &str, size: u64, device_file: &str) -> Self {
        let mut bools: HashMap<BoolProperty, bool> = BoolProperty::EXCLUSIONS
            .iter()
            .map(|p| (*p, false))
            .collect();
        bools.insert(BoolProperty::Drive, true);
        Self {
            bools,
            model: Some(model.to_string()),
            size: Some(size),
            device_file: Some(device_file.to_string()),
        }
    }

    pub fn with(mut self, property: BoolProperty, value: bool) -> Self {
        self.bools.insert(property, value);
        self
    }

    pub fn without(mut self, property: BoolProperty) -> Self {
        self.bools.remove(&property);
        self
    }
}

#[derive(Default)]
pub struct FakeDiskService {
    devices: Mutex<Vec<(String, FakeDevice)>>,
    unavailable: AtomicBool,
    fail_open: AtomicBool,
    list_calls: AtomicUsize,
    writer: Mutex<MemoryWriter>,
}

impl FakeDiskService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, id: &str, device: FakeDevice) -> Self {
        self.set_device(id, device);
        self
    }

    pub fn set_device(&self, id: &str, device: FakeDevice) {
        let mut devices = self.devices.lock().unwrap();
        devices.retain(|(existing, _)| existing != id);
        devices.push((id.to_string(), device));
    }

    pub fn remove_device(&self, id: &str) {
        self.devices.lock().unwrap().retain(|(existing, _)| existing != id);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Writer handed out by the next `open_for_write`
    pub fn set_writer(&self, writer: MemoryWriter) {
        *self.writer.lock().unwrap() = writer;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn device(&self, id: &str) -> Result<FakeDevice> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, device)| device.clone())
            .ok_or_else(|| anyhow!("No such object: {}", id))
    }
}

impl DiskService for FakeDiskService {
    type Writer = MemoryWriter;

    async fn block_devices(&self) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("org.freedesktop.DBus.Error.ServiceUnknown"));
        }
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn bool_property(&self, device: &str, property: BoolProperty) -> Result<bool> {
        self.device(device)?
            .bools
            .get(&property)
            .copied()
            .ok_or_else(|| anyhow!("{} has no property {}", device, property))
    }

    async fn string_property(&self, device: &str, property: StringProperty) -> Result<String> {
        let fake = self.device(device)?;
        let value = match property {
            StringProperty::Model => fake.model,
            StringProperty::DeviceFile => fake.device_file,
        };
        value.ok_or_else(|| anyhow!("{} has no property {}", device, property))
    }

    async fn size(&self, device: &str) -> Result<u64> {
        self.device(device)?
            .size
            .ok_or_else(|| anyhow!("{} has no size", device))
    }

    async fn open_for_write(&self, disk: &Disk) -> Result<MemoryWriter> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(anyhow!("Device or resource busy: {}", disk.device_file));
        }
        self.device(&disk.id)?;
        Ok(self.writer.lock().unwrap().clone())
    }
}
