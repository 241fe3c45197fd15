//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/satellite.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.
//! Pairing results are written back to the same file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SatelliteConfigFile {
    /// Verbose logging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,

    /// Device identity
    #[serde(default)]
    pub device: DeviceFileConfig,

    /// Hub discovery settings
    #[serde(default)]
    pub pairing: PairingFileConfig,

    /// Remote (hub) message bus
    #[serde(default)]
    pub bus: BusFileConfig,

    /// Local (loopback) message bus
    #[serde(default)]
    pub local_bus: BusFileConfig,
}

/// Device identity configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DeviceFileConfig {
    /// Uid attributed by the hub during pairing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Site name announced alongside the uid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,

    /// Device type tag sent to the hub during pairing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
}

/// Hub discovery configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PairingFileConfig {
    /// UDP port the hub broadcasts pairing announcements on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_port: Option<u16>,

    /// Per-cycle UDP receive timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_timeout_ms: Option<u64>,

    /// Receive cycles before giving up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cycles: Option<u32>,

    /// Address announced to the hub instead of the detected one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
}

/// MQTT connection configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusFileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// CA certificate used for TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca_file: Option<PathBuf>,
}

/// Load the TOML config file from `path`
///
/// Returns `SatelliteConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: &Path) -> SatelliteConfigFile {
    if !path.exists() {
        return SatelliteConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                SatelliteConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            SatelliteConfigFile::default()
        }
    }
}

/// Write the config file to `path`, creating parent directories
///
/// # Errors
///
/// Returns error if the file cannot be serialized or written
pub fn save_config_file(path: &Path, file: &SatelliteConfigFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(file)?;
    std::fs::write(path, content)?;

    tracing::debug!(path = %path.display(), "saved config file");
    Ok(())
}

/// Return the config file path: `~/.config/omni/beacon/satellite.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("satellite.toml")
    })
}
