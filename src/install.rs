// Streams the image and the configuration archive onto a disk
//
// Two background tasks run per install: a blocking copy task moving bytes into
// the disk, and a sampler turning the shared byte counter into percentages.
// The caller's task owns the progress callback, so percentages are reported in
// order from a single place and the copy never waits on the UI.

use crate::disk::{BlockWriter, DiskSink};
use crate::error::InstallError;
use crate::models::CancelToken;
use crate::utils::{ByteCounter, CountingWriter, bytes_to_mb, spawn_progress_sampler};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// How often progress is reported
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

const COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Write `image` followed by `config_archive` to `sink`.
///
/// `on_progress` receives the percentage of `image_size` written so far, never
/// decreasing, and a final 100 on success. Cancelling `cancel` closes the sink,
/// which makes the pending write fail; the copy task is always finished by the
/// time this returns. On success the sink has been synced and closed. On
/// failure it is closed as well but a close error never replaces the original
/// one.
///
/// Dropping the returned future before it completes closes the sink as well, so
/// the copy stops at the next write instead of running on unobserved.
pub async fn install<W, F>(
    sink: DiskSink<W>,
    image: Box<dyn Read + Send>,
    config_archive: Vec<u8>,
    image_size: u64,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<(), InstallError>
where
    W: BlockWriter,
    F: FnMut(f64),
{
    install_holding(sink, image, config_archive, image_size, cancel, on_progress, ()).await
}

/// Same as [`install`], with `session` dropped only once the copy task has
/// finished, even when this future is dropped early.
pub(crate) async fn install_holding<W, F, S>(
    sink: DiskSink<W>,
    image: Box<dyn Read + Send>,
    config_archive: Vec<u8>,
    image_size: u64,
    cancel: &CancelToken,
    mut on_progress: F,
    session: S,
) -> Result<(), InstallError>
where
    W: BlockWriter,
    F: FnMut(f64),
    S: Send + 'static,
{
    let started = Instant::now();
    let counter = ByteCounter::new();
    let _abandon = CloseOnDrop(sink.clone());

    // Single-shot: the first outcome published wins
    let (result_tx, mut result_rx) = oneshot::channel();
    let copy_task = {
        let writer = CountingWriter::new(sink.clone(), counter.clone());
        tokio::task::spawn_blocking(move || {
            let _session = session;
            let result = copy_all(image, &config_archive, writer);
            result_tx.send(result).ok();
        })
    };

    let (sampler, mut progress) = spawn_progress_sampler(counter.clone(), image_size, PROGRESS_INTERVAL);
    info!("Writing image ({:.1} MB)", bytes_to_mb(image_size));

    let outcome = loop {
        tokio::select! {
            Some(percent) = progress.recv() => on_progress(percent),

            _ = cancel.cancelled() => {
                info!("Install cancelled, closing disk");
                let closer = sink.clone();
                match tokio::task::spawn_blocking(move || closer.close()).await {
                    Ok(Err(e)) => debug!("Ignoring close error after cancel: {}", e),
                    Err(e) => warn!("Close task failed: {}", e),
                    Ok(Ok(())) => {}
                }
                // Wait for the copy to observe the closed disk
                if let Ok(Err(e)) = (&mut result_rx).await {
                    debug!("Copy stopped after cancel: {}", e);
                }
                break Err(InstallError::Cancelled);
            }

            result = &mut result_rx => {
                let result = result.unwrap_or_else(|_| {
                    Err(InstallError::Write(io::Error::other("copy task ended without a result")))
                });
                break finish(sink.clone(), result).await;
            }
        }
    };

    sampler.abort();
    if let Err(e) = copy_task.await {
        error!("Copy task failed: {}", e);
    }

    match &outcome {
        Ok(()) => {
            on_progress(100.0);
            info!(
                "Install completed: {:.1} MB in {:?}",
                bytes_to_mb(counter.get()),
                started.elapsed()
            );
        }
        Err(InstallError::Cancelled) => info!("Install cancelled after {:.1} MB", bytes_to_mb(counter.get())),
        Err(e) => error!("Install failed: {}", e),
    }
    outcome
}

/// Closes the sink if the install is abandoned before it closed it itself
struct CloseOnDrop<W: BlockWriter>(DiskSink<W>);

impl<W: BlockWriter> Drop for CloseOnDrop<W> {
    fn drop(&mut self) {
        if self.0.is_closed() {
            return;
        }
        warn!("Install abandoned while writing, closing disk");
        let sink = self.0.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    if let Err(e) = sink.close() {
                        debug!("Ignoring close error after abandoned install: {}", e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = sink.close() {
                    debug!("Ignoring close error after abandoned install: {}", e);
                }
            }
        }
    }
}

/// Close the disk after the copy returned and pick the error to report
async fn finish<W: BlockWriter>(
    sink: DiskSink<W>,
    copied: Result<u64, InstallError>,
) -> Result<(), InstallError> {
    let closed = tokio::task::spawn_blocking(move || sink.close())
        .await
        .map_err(|e| InstallError::Write(io::Error::other(e)))?;

    match copied {
        Ok(total) => {
            closed.map_err(InstallError::Write)?;
            debug!("Wrote {} bytes in total", total);
            Ok(())
        }
        Err(e) => {
            if let Err(close_error) = closed {
                debug!("Ignoring close error after failed write: {}", close_error);
            }
            Err(e)
        }
    }
}

fn copy_all<W: Write>(
    mut image: Box<dyn Read + Send>,
    config_archive: &[u8],
    mut out: W,
) -> Result<u64, InstallError> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let bytes_read = match image.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Error reading image: {}", e);
                return Err(InstallError::Decompress(e));
            }
        };

        out.write_all(&buffer[..bytes_read]).map_err(|e| {
            error!("Error writing to disk: {}", e);
            InstallError::Write(e)
        })?;
        total += bytes_read as u64;
    }

    info!(
        "Image copied ({:.1} MB), appending configuration",
        bytes_to_mb(total)
    );
    out.write_all(config_archive).map_err(InstallError::Write)?;
    out.flush().map_err(InstallError::Write)?;
    Ok(total + config_archive.len() as u64)
}
