// Access to the packaged, xz compressed disk image
//
// The image is decoded lazily, in order, while it is being written. Nothing is
// cached between install attempts and memory use does not depend on image size.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;
use xz4rust::XzReader;

mod manifest;
mod uuid_patch;

pub use manifest::{BOOT_ID_LEN, ImageManifest, ROOT_ID_LEN, UuidPatchSpec};
pub use uuid_patch::UuidPatcher;

const XZ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Provider of the compressed image bytes
pub trait ImageSource: Send + Sync {
    /// A fresh reader positioned at the start of the compressed asset
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// Compressed image stored in a file
#[derive(Debug, Clone)]
pub struct FileImage {
    path: PathBuf,
}

impl FileImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileImage {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        debug!("Opening image file: {:?}", self.path);
        let file = File::open(&self.path)?;
        Ok(Box::new(BufReader::with_capacity(XZ_BUFFER_SIZE, file)))
    }
}

/// Compressed image linked into the binary, e.g. with `include_bytes!`
#[derive(Debug, Clone, Copy)]
pub struct StaticImage(pub &'static [u8]);

impl ImageSource for StaticImage {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.0))
    }
}

/// Yields exactly `expected` bytes from `inner` or fails.
///
/// Ending early is reported as `UnexpectedEof`, producing more as `InvalidData`.
pub struct ExactLengthReader<R: Read> {
    inner: R,
    expected: u64,
    produced: u64,
}

impl<R: Read> ExactLengthReader<R> {
    pub fn new(inner: R, expected: u64) -> Self {
        Self {
            inner,
            expected,
            produced: 0,
        }
    }
}

impl<R: Read> Read for ExactLengthReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.produced == self.expected {
            // Anything left in the stream means the manifest and image disagree
            let mut probe = [0u8; 1];
            return match self.inner.read(&mut probe)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("image is larger than the expected {} bytes", self.expected),
                )),
            };
        }

        let remaining = self.expected - self.produced;
        let limit = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..limit])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "image ended after {} of {} bytes",
                    self.produced, self.expected
                ),
            ));
        }
        self.produced += n as u64;
        Ok(n)
    }
}

/// Freshly generated filesystem identifiers for one install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeIds {
    pub boot: [u8; BOOT_ID_LEN],
    pub root: [u8; ROOT_ID_LEN],
}

impl VolumeIds {
    pub fn random() -> Self {
        let root = *Uuid::new_v4().as_bytes();
        let mut boot = [0u8; BOOT_ID_LEN];
        boot.copy_from_slice(&Uuid::new_v4().as_bytes()[..BOOT_ID_LEN]);
        Self { boot, root }
    }
}

/// Opens the decompressed image stream for one install attempt.
///
/// When the manifest carries a `[uuid_patch]` section the boot and root
/// identifiers are replaced with `ids` as the stream passes them.
pub fn open_image(
    source: &dyn ImageSource,
    manifest: &ImageManifest,
    ids: Option<VolumeIds>,
) -> Result<Box<dyn Read + Send>> {
    let compressed = source.open().context("Failed to open compressed image")?;

    let buffer_size = NonZeroUsize::new(XZ_BUFFER_SIZE).context("zero xz buffer size")?;
    info!("Creating XZ reader with buffer size: {} bytes", buffer_size);
    let decoded = ExactLengthReader::new(
        XzReader::new_with_buffer_size(compressed, buffer_size),
        manifest.image_size,
    );

    match (&manifest.uuid_patch, ids) {
        (Some(spec), Some(ids)) => {
            let patcher = UuidPatcher::new(decoded)
                .with_patch("boot volume", &spec.boot_id_bytes()?, &ids.boot)
                .with_patch("root filesystem", &spec.root_id_bytes()?, &ids.root);
            info!(
                "Patching filesystem identifiers: boot {} root {}",
                hex::encode(ids.boot),
                Uuid::from_bytes(ids.root)
            );
            Ok(Box::new(patcher))
        }
        _ => Ok(Box::new(decoded)),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::io::Write;

    /// xz compress `data` the way the image packaging step does
    pub fn xz(data: &[u8]) -> Vec<u8> {
        let stream = xz2::stream::Stream::new_easy_encoder(6, xz2::stream::Check::Crc32).unwrap();
        let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Deterministic, mildly compressible test payload
    pub fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 7) % 253) as u8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{payload, xz};
    use super::*;

    struct Memory(Vec<u8>);

    impl ImageSource for Memory {
        fn open(&self) -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(io::Cursor::new(self.0.clone())))
        }
    }

    fn manifest(image_size: u64) -> ImageManifest {
        ImageManifest {
            image_size,
            config_size: 4096,
            uuid_patch: None,
        }
    }

    fn read_all(mut r: impl Read) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_decompresses_exact_length() {
        let data = payload(300_000);
        let source = Memory(xz(&data));
        let reader = open_image(&source, &manifest(data.len() as u64), None).unwrap();
        assert_eq!(read_all(reader).unwrap(), data);
    }

    #[test]
    fn test_short_image_is_an_error() {
        let data = payload(1000);
        let source = Memory(xz(&data));
        let reader = open_image(&source, &manifest(1001), None).unwrap();
        let err = read_all(reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_long_image_is_an_error() {
        let data = payload(1000);
        let source = Memory(xz(&data));
        let reader = open_image(&source, &manifest(999), None).unwrap();
        let err = read_all(reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_compressed_data_is_an_error() {
        let data = payload(100_000);
        let mut compressed = xz(&data);
        compressed.truncate(compressed.len() / 2);
        let reader = open_image(&Memory(compressed), &manifest(data.len() as u64), None).unwrap();
        assert!(read_all(reader).is_err());
    }

    #[test]
    fn test_corrupt_compressed_data_is_an_error() {
        let data = payload(100_000);
        let mut compressed = xz(&data);
        let middle = compressed.len() / 2;
        compressed[middle] ^= 0xff;
        let reader = open_image(&Memory(compressed), &manifest(data.len() as u64), None).unwrap();
        assert!(read_all(reader).is_err());
    }

    #[test]
    fn test_uuid_patch_applied_in_stream() {
        let boot = [0xde, 0xad, 0xbe, 0xef];
        let root = *b"0123456789abcdef";
        let mut data = payload(200_000);
        data[1000..1004].copy_from_slice(&boot);
        data[150_000..150_016].copy_from_slice(&root);

        let mut manifest = manifest(data.len() as u64);
        manifest.uuid_patch = Some(UuidPatchSpec {
            boot_id: hex::encode(boot),
            root_id: hex::encode(root),
        });

        let ids = VolumeIds::random();
        let out = read_all(open_image(&Memory(xz(&data)), &manifest, Some(ids)).unwrap()).unwrap();
        assert_eq!(out.len(), data.len());
        assert_eq!(&out[1000..1004], &ids.boot);
        assert_eq!(&out[150_000..150_016], &ids.root);
        assert_eq!(&out[..1000], &data[..1000]);
        assert_eq!(&out[150_016..], &data[150_016..]);
    }

    #[test]
    fn test_random_ids_differ() {
        let a = VolumeIds::random();
        let b = VolumeIds::random();
        assert_ne!(a.root, b.root);
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_image_source() {
        let data = payload(5000);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), xz(&data)).unwrap();
        let source = FileImage::new(file.path());
        let reader = open_image(&source, &manifest(data.len() as u64), None).unwrap();
        assert_eq!(read_all(reader).unwrap(), data);
    }
}
