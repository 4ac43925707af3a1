// Per-install configuration appended after the image

use crate::error::InstallError;
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use std::io::{self, Read};
use tracing::debug;

pub const DEFAULT_HOSTNAME: &str = "alarmpi";

/// WPA passphrase to PSK derivation parameters (IEEE 802.11i)
const PSK_ITERATIONS: u32 = 4096;
const PSK_LEN: usize = 32;

const HOSTNAME_ENTRY: &str = "hostname";
const WIFI_SSID_ENTRY: &str = "wifi_ssid";
const WIFI_PSK_ENTRY: &str = "wifi_psk";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallConfig {
    hostname: String,
    wifi_ssid: Option<String>,
    wifi_password: Option<String>,
}

impl InstallConfig {
    /// Hostname is trimmed and must not be blank. Empty SSID or password are
    /// treated as absent.
    pub fn new(
        hostname: &str,
        wifi_ssid: Option<String>,
        wifi_password: Option<String>,
    ) -> Result<Self, InstallError> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(InstallError::InvalidConfig(
                "hostname must not be blank".to_string(),
            ));
        }
        Ok(Self {
            hostname: hostname.to_string(),
            wifi_ssid: wifi_ssid.filter(|s| !s.is_empty()),
            wifi_password: wifi_password.filter(|s| !s.is_empty()),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn wifi_ssid(&self) -> Option<&str> {
        self.wifi_ssid.as_deref()
    }

    pub fn has_wifi_password(&self) -> bool {
        self.wifi_password.is_some()
    }

    /// Serialize as a tar archive padded with zeros to exactly `config_size` bytes.
    ///
    /// Entries: `hostname`, then `wifi_ssid` when an SSID is set, then `wifi_psk`
    /// when a password is set as well. The password itself is never written.
    /// Output is deterministic for a given configuration.
    pub fn to_archive(&self, config_size: u64) -> io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());

        append_entry(&mut builder, HOSTNAME_ENTRY, self.hostname.as_bytes())?;
        if let Some(ssid) = &self.wifi_ssid {
            append_entry(&mut builder, WIFI_SSID_ENTRY, ssid.as_bytes())?;
            if let Some(password) = &self.wifi_password {
                let psk = wifi_psk(ssid, password);
                append_entry(&mut builder, WIFI_PSK_ENTRY, psk.as_bytes())?;
            }
        }

        let mut archive = builder.into_inner()?;
        let config_size = usize::try_from(config_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "config size too large"))?;
        if archive.len() > config_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "configuration archive is {} bytes, only {} reserved",
                    archive.len(),
                    config_size
                ),
            ));
        }
        debug!(
            "Configuration archive is {} bytes, padding to {}",
            archive.len(),
            config_size
        );
        archive.resize(config_size, 0);
        Ok(archive)
    }
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, name: &str, content: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_path(name)?;
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(0o666);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    builder.append(&header, content)
}

/// WPA pairwise master key for `password` on network `ssid`, hex encoded
pub fn wifi_psk(ssid: &str, password: &str) -> String {
    let mut key = [0u8; PSK_LEN];
    pbkdf2_hmac::<Sha1>(password.as_bytes(), ssid.as_bytes(), PSK_ITERATIONS, &mut key);
    hex::encode(key)
}

/// Entries read back from a configuration archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigEntries {
    pub hostname: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_psk: Option<String>,
}

impl ConfigEntries {
    /// Parse an archive produced by [`InstallConfig::to_archive`], padding included
    pub fn from_archive(data: &[u8]) -> io::Result<Self> {
        let mut entries = ConfigEntries::default();
        let mut archive = tar::Archive::new(data);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            match name.as_str() {
                HOSTNAME_ENTRY => entries.hostname = Some(content),
                WIFI_SSID_ENTRY => entries.wifi_ssid = Some(content),
                WIFI_PSK_ENTRY => entries.wifi_psk = Some(content),
                other => debug!("Ignoring unknown configuration entry {}", other),
            }
        }
        Ok(entries)
    }
}
