// Installs the Arch Linux ARM image for the Raspberry Pi onto a removable disk
//
// Presentation layers talk to `installer::Installer`; everything below it can be
// driven directly by tools and tests.

pub mod configuration;
pub mod disk;
pub mod error;
pub mod image;
pub mod install;
pub mod installer;
pub mod models;
pub mod utils;

pub use configuration::{DEFAULT_HOSTNAME, InstallConfig};
pub use error::InstallError;
pub use image::{FileImage, ImageManifest, ImageSource};
pub use installer::Installer;
pub use models::{CancelToken, Disk, DiskSummary};
