//! Error types for the Beacon satellite

use thiserror::Error;

/// Result type alias for satellite operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Beacon satellite
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Hub discovery failed
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// The hub refused the greeting
    #[error("the hub refused this satellite")]
    Refused,

    /// Message bus error
    #[error("bus error: {0}")]
    Bus(String),

    /// MQTT client error
    #[error("mqtt error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML writing error
    #[error("toml write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    /// A task or channel went away during shutdown
    #[error("shutting down: {0}")]
    Shutdown(String),
}

impl Error {
    /// Whether this error must terminate the process
    ///
    /// Bus and serialization failures are recoverable; a satellite that
    /// cannot find or join a hub, or has no usable configuration, is not.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Discovery(_) | Self::Refused)
    }
}

/// Failure modes of the UDP/TCP pairing handshake
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No announcement arrived within the allowed receive cycles
    #[error("no main unit found, was the hub asked to add a new device?")]
    NoHubFound,

    /// The announcement could not be parsed
    #[error("bad formatting in the main unit announcement: {0}")]
    Malformed(String),

    /// The hub never sent its verdict
    #[error("the main unit did not answer")]
    NoAnswer,

    /// The hub sent anything other than `ok`
    #[error("the main unit refused the addition: {0}")]
    Refused(String),

    /// Socket failure while pairing
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Refused.is_fatal());
        assert!(Error::Discovery(DiscoveryError::NoHubFound).is_fatal());
        assert!(Error::Config("missing uid".to_string()).is_fatal());
        assert!(!Error::Bus("not connected".to_string()).is_fatal());
        assert!(!Error::Shutdown("router".to_string()).is_fatal());
    }

    #[test]
    fn discovery_errors_render() {
        let err = Error::from(DiscoveryError::Refused("nope".to_string()));
        assert_eq!(
            err.to_string(),
            "discovery error: the main unit refused the addition: nope"
        );
    }
}
