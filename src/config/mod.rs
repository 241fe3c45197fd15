//! Configuration management for the Beacon satellite
//!
//! Values are layered: defaults, then the TOML file, then environment
//! variables. The binary applies CLI flags on top.

pub mod file;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::pairing::{DEFAULT_SITE_NAME, DeviceIdentity};
use crate::{Error, Result};

pub use file::{SatelliteConfigFile, config_file_path, load_config_file, save_config_file};

/// Default UDP port the hub broadcasts pairing announcements on
pub const DEFAULT_BROADCAST_PORT: u16 = 12354;

/// Default MQTT port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Tag sent to the hub to describe this device
pub const DEFAULT_DEVICE_TYPE: &str = "Satellite";

/// Configuration shared between the pairing machine and the router
pub type SharedConfig = Arc<RwLock<Config>>;

/// Satellite configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// File the configuration was read from and pairing results are saved to
    pub path: PathBuf,

    /// Verbose logging requested by configuration
    pub debug: bool,

    /// Device identity configuration
    pub device: DeviceConfig,

    /// Hub discovery configuration
    pub pairing: PairingConfig,

    /// Remote (hub-facing) bus
    pub bus: BusConfig,

    /// Local (loopback) bus
    pub local_bus: BusConfig,
}

/// Device identity configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Uid attributed by the hub, absent until paired
    pub uid: Option<String>,

    /// Site name announced with the uid
    pub site_name: String,

    /// Device type tag sent during pairing
    pub type_tag: String,
}

/// Hub discovery configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// UDP port for hub announcements
    pub broadcast_port: u16,

    /// Per-cycle receive timeout
    pub receive_timeout: Duration,

    /// Receive cycles before discovery gives up
    pub max_cycles: u32,

    /// Address announced to the hub instead of the detected one
    pub local_ip: Option<IpAddr>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            broadcast_port: DEFAULT_BROADCAST_PORT,
            receive_timeout: Duration::from_secs(3),
            max_cycles: 5,
            local_ip: None,
        }
    }
}

/// MQTT connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Broker host
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Username, if the broker is password protected
    pub username: Option<String>,

    /// Password, if the broker is password protected
    pub password: Option<String>,

    /// CA certificate enabling TLS
    pub tls_ca_file: Option<PathBuf>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            tls_ca_file: None,
        }
    }
}

impl BusConfig {
    /// Credentials, only when both username and password are set
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    fn overlay(&mut self, file: &file::BusFileConfig) {
        if let Some(host) = &file.host {
            self.host.clone_from(host);
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if file.username.is_some() {
            self.username.clone_from(&file.username);
        }
        if file.password.is_some() {
            self.password.clone_from(&file.password);
        }
        if file.tls_ca_file.is_some() {
            self.tls_ca_file.clone_from(&file.tls_ca_file);
        }
    }
}

/// Default site name: the machine hostname
fn default_site_name() -> String {
    hostname::get().map_or_else(
        |_| DEFAULT_SITE_NAME.to_string(),
        |h| h.to_string_lossy().to_string(),
    )
}

impl Config {
    /// Load configuration from `path` (or the default location) and the environment
    ///
    /// # Errors
    ///
    /// Returns error if no config path can be determined or a value is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_file_path()
                .ok_or_else(|| Error::Config("cannot determine config directory".to_string()))?,
        };

        let file = load_config_file(&path);
        let mut config = Self::from_file(path, &file)?;
        config.apply_env()?;

        Ok(config)
    }

    /// Build configuration from a parsed file, without consulting the environment
    ///
    /// # Errors
    ///
    /// Returns error if a value in the file is invalid
    pub fn from_file(path: PathBuf, file: &SatelliteConfigFile) -> Result<Self> {
        let mut pairing = PairingConfig::default();
        if let Some(port) = file.pairing.broadcast_port {
            pairing.broadcast_port = port;
        }
        if let Some(ms) = file.pairing.receive_timeout_ms {
            pairing.receive_timeout = Duration::from_millis(ms);
        }
        if let Some(cycles) = file.pairing.max_cycles {
            pairing.max_cycles = cycles;
        }
        if let Some(ip) = &file.pairing.local_ip {
            pairing.local_ip = Some(parse_ip(ip)?);
        }

        let mut bus = BusConfig::default();
        bus.overlay(&file.bus);

        let mut local_bus = BusConfig::default();
        local_bus.overlay(&file.local_bus);

        let device = DeviceConfig {
            uid: file.device.uid.clone().filter(|uid| !uid.is_empty()),
            site_name: file
                .device
                .site_name
                .clone()
                .unwrap_or_else(default_site_name),
            type_tag: file
                .device
                .type_tag
                .clone()
                .unwrap_or_else(|| DEFAULT_DEVICE_TYPE.to_string()),
        };

        Ok(Self {
            path,
            debug: file.debug.unwrap_or(false),
            device,
            pairing,
            bus,
            local_bus,
        })
    }

    /// Apply environment variable overrides
    ///
    /// Reads `SATELLITE_UID`, `SATELLITE_SITE_NAME`, `SATELLITE_BROADCAST_PORT`,
    /// `SATELLITE_DEBUG`, `MQTT_HOST`, `MQTT_PORT`, `MQTT_USER`, `MQTT_PASSWORD`,
    /// `MQTT_TLS_FILE`, `LOCAL_MQTT_HOST` and `LOCAL_MQTT_PORT`.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uid) = std::env::var("SATELLITE_UID") {
            self.device.uid = Some(uid).filter(|u| !u.is_empty());
        }
        if let Ok(site) = std::env::var("SATELLITE_SITE_NAME") {
            self.device.site_name = site;
        }
        if let Ok(port) = std::env::var("SATELLITE_BROADCAST_PORT") {
            self.pairing.broadcast_port = parse_port("SATELLITE_BROADCAST_PORT", &port)?;
        }
        if let Ok(v) = std::env::var("SATELLITE_DEBUG") {
            self.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }

        if let Ok(host) = std::env::var("MQTT_HOST") {
            self.bus.host = host;
        }
        if let Ok(port) = std::env::var("MQTT_PORT") {
            self.bus.port = parse_port("MQTT_PORT", &port)?;
        }
        if let Ok(user) = std::env::var("MQTT_USER") {
            self.bus.username = Some(user);
        }
        if let Ok(pass) = std::env::var("MQTT_PASSWORD") {
            self.bus.password = Some(pass);
        }
        if let Ok(tls) = std::env::var("MQTT_TLS_FILE") {
            self.bus.tls_ca_file = Some(PathBuf::from(tls)).filter(|p| !p.as_os_str().is_empty());
        }

        if let Ok(host) = std::env::var("LOCAL_MQTT_HOST") {
            self.local_bus.host = host;
        }
        if let Ok(port) = std::env::var("LOCAL_MQTT_PORT") {
            self.local_bus.port = parse_port("LOCAL_MQTT_PORT", &port)?;
        }

        Ok(())
    }

    /// Wrap into a [`SharedConfig`]
    #[must_use]
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// The persisted device identity, if this satellite was already paired
    #[must_use]
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.device
            .uid
            .as_ref()
            .map(|uid| DeviceIdentity::new(uid.clone(), self.device.site_name.clone()))
    }

    /// Record a successful pairing and save it to the config file
    ///
    /// The hub address becomes the remote bus host and the attributed uid
    /// becomes the device uid.
    ///
    /// # Errors
    ///
    /// Returns error if the config file cannot be written
    pub fn persist_pairing(&mut self, hub_host: &str, uid: &str) -> Result<()> {
        self.bus.host = hub_host.to_string();
        self.device.uid = Some(uid.to_string());

        let mut file = load_config_file(&self.path);
        file.bus.host = Some(hub_host.to_string());
        file.device.uid = Some(uid.to_string());
        save_config_file(&self.path, &file)?;

        tracing::info!(
            path = %self.path.display(),
            hub = hub_host,
            uid,
            "saved pairing to config file"
        );
        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key} '{value}': {e}")))
}

fn parse_ip(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid local ip '{value}': {e}")))
}
