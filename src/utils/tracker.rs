use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::utils::bytes_to_mb;

/// Monotonically increasing count of bytes pushed into a sink.
///
/// Shared between the copy task (writer) and the progress sampler (reader).
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct CountingWriter<W: Write> {
    inner: W,
    counter: ByteCounter,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W, counter: ByteCounter) -> Self {
        Self { inner, counter }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let bytes = self.inner.write(buf)?;
        self.counter.add(bytes as u64);
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Percentage of `total` covered by `written`, capped at 100
pub fn percent_of(written: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (written as f64 / total as f64 * 100.0).min(100.0)
}

/// Samples `counter` every `period` and sends the percentage of `total` written.
///
/// Values are never sent out of order and never decrease. The task ends when the
/// receiver is dropped.
pub fn spawn_progress_sampler(
    counter: ByteCounter,
    total: u64,
    period: Duration,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<f64>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick of an interval completes immediately
        ticker.tick().await;
        let mut last = 0f64;
        loop {
            ticker.tick().await;
            let written = counter.get();
            let percent = percent_of(written, total).max(last);
            debug!(
                "Progress sample: {:.1} MB / {:.1} MB ({:.1}%)",
                bytes_to_mb(written),
                bytes_to_mb(total),
                percent
            );
            last = percent;
            if tx.send(percent).is_err() {
                break;
            }
        }
    });

    (handle, rx)
}
