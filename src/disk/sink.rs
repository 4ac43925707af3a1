// Write side of a privileged disk handle

use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A raw, write-capable handle to a block device
pub trait BlockWriter: Write + Send + 'static {
    /// Push pending writes to stable storage
    fn sync(&mut self) -> io::Result<()>;

    /// Release the handle, reporting any error from the close itself
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

impl BlockWriter for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn close(self) -> io::Result<()> {
        close_file(self)
    }
}

#[cfg(target_os = "linux")]
fn close_file(file: File) -> io::Result<()> {
    use std::os::unix::io::IntoRawFd;

    let fd = file.into_raw_fd();
    // SAFETY: `fd` was just released from an owned File and is closed exactly once
    if unsafe { libc::close(fd) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn close_file(file: File) -> io::Result<()> {
    drop(file);
    Ok(())
}

/// Shared handle over a [`BlockWriter`].
///
/// Clones refer to the same device. `close` may be called from any clone while
/// another one is writing: it waits for the pending write call to return, then
/// every later write fails with [`io::ErrorKind::BrokenPipe`]. This is how an
/// in-flight install is cancelled.
pub struct DiskSink<W: BlockWriter> {
    inner: Arc<Mutex<Option<W>>>,
}

impl<W: BlockWriter> Clone for DiskSink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: BlockWriter> DiskSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Option<W>>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("disk handle lock poisoned"))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }

    /// Sync and release the device.
    ///
    /// A sync failure is reported in preference to a close failure. Closing an
    /// already closed sink is a no-op.
    pub fn close(&self) -> io::Result<()> {
        let Some(mut writer) = self.lock()?.take() else {
            debug!("Disk handle already closed");
            return Ok(());
        };

        info!("Syncing disk before close");
        let sync_start = std::time::Instant::now();
        let synced = writer.flush().and_then(|_| writer.sync());
        match &synced {
            Ok(()) => info!("Disk sync completed in {:?}", sync_start.elapsed()),
            Err(e) => warn!("Disk sync failed after {:?}: {}", sync_start.elapsed(), e),
        }

        let closed = writer.close();
        if let Err(e) = &closed {
            warn!("Closing disk handle failed: {}", e);
        }

        synced.and(closed)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "disk handle is closed")
}

impl<W: BlockWriter> Write for DiskSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.lock()?.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(closed_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.lock()?.as_mut() {
            Some(writer) => writer.flush(),
            None => Err(closed_error()),
        }
    }
}
