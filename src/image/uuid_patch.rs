use std::io::{self, Read};
use tracing::{debug, info};

const CHUNK_SIZE: usize = 64 * 1024;

struct Patch {
    label: &'static str,
    pattern: Vec<u8>,
    replacement: Vec<u8>,
    applied: bool,
}

/// Replaces the first occurrence of each pattern in a byte stream.
///
/// The scan is a single forward pass. Up to `longest pattern - 1` bytes are held
/// back between reads so a match straddling two reads of the inner stream is
/// still found. Once every pattern has been replaced the reader degrades to a
/// plain pass-through.
pub struct UuidPatcher<R: Read> {
    inner: R,
    patches: Vec<Patch>,
    buf: Vec<u8>,
    // Bytes of `buf` before `start` were already handed out
    start: usize,
    // Bytes of `buf` before `ready` are final
    ready: usize,
    eof: bool,
}

impl<R: Read> UuidPatcher<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            patches: Vec::new(),
            buf: Vec::with_capacity(CHUNK_SIZE),
            start: 0,
            ready: 0,
            eof: false,
        }
    }

    /// Replace the first occurrence of `pattern` with `replacement` (same length)
    pub fn with_patch(mut self, label: &'static str, pattern: &[u8], replacement: &[u8]) -> Self {
        assert_eq!(pattern.len(), replacement.len(), "patch must keep the stream length");
        assert!(!pattern.is_empty(), "empty patch pattern");
        self.patches.push(Patch {
            label,
            pattern: pattern.to_vec(),
            replacement: replacement.to_vec(),
            applied: false,
        });
        self
    }

    /// Labels of the patches applied so far
    pub fn applied(&self) -> Vec<&'static str> {
        self.patches
            .iter()
            .filter(|p| p.applied)
            .map(|p| p.label)
            .collect()
    }

    fn holdback(&self) -> usize {
        self.patches
            .iter()
            .filter(|p| !p.applied)
            .map(|p| p.pattern.len() - 1)
            .max()
            .unwrap_or(0)
    }

    fn apply_patches(&mut self) {
        let window = &mut self.buf[self.start..];
        for patch in self.patches.iter_mut().filter(|p| !p.applied) {
            let len = patch.pattern.len();
            if let Some(pos) = window.windows(len).position(|w| w == patch.pattern.as_slice()) {
                window[pos..pos + len].copy_from_slice(&patch.replacement);
                patch.applied = true;
                info!("Replaced {} identifier", patch.label);
            }
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        // Drop consumed bytes before growing the buffer
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.ready -= self.start;
            self.start = 0;
        }

        let old_len = self.buf.len();
        self.buf.resize(old_len + CHUNK_SIZE, 0);
        let n = match self.inner.read(&mut self.buf[old_len..]) {
            Ok(n) => n,
            Err(e) => {
                self.buf.truncate(old_len);
                return Err(e);
            }
        };
        self.buf.truncate(old_len + n);

        if n == 0 {
            self.eof = true;
            let pending: Vec<_> = self
                .patches
                .iter()
                .filter(|p| !p.applied)
                .map(|p| p.label)
                .collect();
            if !pending.is_empty() {
                debug!("End of stream without a match for {:?}", pending);
            }
        } else {
            self.apply_patches();
        }

        self.ready = if self.eof {
            self.buf.len()
        } else {
            self.buf.len().saturating_sub(self.holdback())
        };
        Ok(())
    }
}

impl<R: Read> Read for UuidPatcher<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.ready > self.start {
                let n = out.len().min(self.ready - self.start);
                out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
                self.start += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            self.fill()?;
        }
    }
}
