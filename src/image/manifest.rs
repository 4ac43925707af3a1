use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Describes the packaged image: its decompressed size and how much room the
/// installed bootstrap script expects for the trailing configuration archive.
///
/// ```toml
/// image_size = 1887436800
/// config_size = 1000000
///
/// [uuid_patch]
/// boot_id = "5a3c1e2f"
/// root_id = "0d4f...16 bytes in hex"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Exact number of bytes the decompressed image produces
    pub image_size: u64,
    /// Size of the region reserved after the image for the config archive
    pub config_size: u64,
    #[serde(default)]
    pub uuid_patch: Option<UuidPatchSpec>,
}

/// Filesystem identifiers baked into the image that get replaced on every install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidPatchSpec {
    /// Boot (FAT) volume serial, hex encoded, 4 bytes
    pub boot_id: String,
    /// Root filesystem UUID, hex encoded, 16 bytes
    pub root_id: String,
}

pub const BOOT_ID_LEN: usize = 4;
pub const ROOT_ID_LEN: usize = 16;

impl UuidPatchSpec {
    pub fn boot_id_bytes(&self) -> Result<[u8; BOOT_ID_LEN]> {
        decode_id("boot_id", &self.boot_id)
    }

    pub fn root_id_bytes(&self) -> Result<[u8; ROOT_ID_LEN]> {
        decode_id("root_id", &self.root_id)
    }
}

fn decode_id<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    // Allow the usual dashed UUID notation
    let cleaned: String = value.chars().filter(|c| *c != '-').collect();
    let bytes = hex::decode(&cleaned).with_context(|| format!("{} is not valid hex", field))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow!("{} must be {} bytes, got {}", field, N, b.len()))
}

impl ImageManifest {
    /// Smallest disk able to hold the image and the config region
    pub fn required_disk_size(&self) -> u64 {
        self.image_size + self.config_size
    }

    pub fn from_toml_content(content: &str) -> Result<Self> {
        let manifest: ImageManifest =
            toml::from_str(content).context("Failed to parse image manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading image manifest from {:?}", path);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read image manifest {:?}", path))?;
        Self::from_toml_content(&content)
    }

    pub fn to_toml_content(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Manifest conventionally stored next to the image: `image.img.xz` -> `image.img.xz.toml`
    pub fn sidecar_path(image_path: &Path) -> PathBuf {
        let mut name = image_path.as_os_str().to_owned();
        name.push(".toml");
        PathBuf::from(name)
    }

    fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(anyhow!("image_size must not be zero"));
        }
        if self.config_size == 0 {
            return Err(anyhow!("config_size must not be zero"));
        }
        if let Some(patch) = &self.uuid_patch {
            patch.boot_id_bytes()?;
            patch.root_id_bytes()?;
        }
        Ok(())
    }
}
