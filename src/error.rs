use std::io;
use thiserror::Error;

/// Errors surfaced to the presentation layer.
///
/// None of these are retried internally. After `Write` or `Cancelled` the target
/// is left partially written and the install has to be restarted from scratch.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Disk service unavailable: {0:#}")]
    ServiceUnavailable(anyhow::Error),

    #[error("Disk {0} is no longer available")]
    DeviceNotFound(String),

    #[error("Disk {disk} is too small: {size} bytes, at least {required} bytes required")]
    TargetTooSmall { disk: String, size: u64, required: u64 },

    #[error("Invalid install configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open disk for writing: {0:#}")]
    OpenDevice(anyhow::Error),

    #[error("Failed to decompress image: {0}")]
    Decompress(#[source] io::Error),

    #[error("Failed to write to disk: {0}")]
    Write(#[source] io::Error),

    /// Aborted by the operator, not a failure
    #[error("Install cancelled")]
    Cancelled,

    #[error("Another install is already in progress")]
    Busy,
}

impl InstallError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InstallError::Cancelled)
    }
}
