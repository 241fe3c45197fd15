//! Device identity attributed by the hub
//!
//! The identity travels in every greeting, heartbeat and disconnection notice
//! and is what the router filters inbound messages against.

use serde::{Deserialize, Serialize};

/// Site name used when neither configuration nor hostname provide one
pub const DEFAULT_SITE_NAME: &str = "default";

/// Identity of this satellite on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Uid attributed by the hub
    pub uid: String,

    /// Human-readable site the device lives in
    #[serde(rename = "siteId")]
    pub site_name: String,
}

impl DeviceIdentity {
    /// Create an identity from its parts
    #[must_use]
    pub fn new(uid: impl Into<String>, site_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            site_name: site_name.into(),
        }
    }

    /// Whether a message addressed to `target` is meant for this device
    #[must_use]
    pub fn is_addressed_by(&self, target: &str) -> bool {
        self.uid == target
    }

    /// Payload announced on greeting, heartbeat and disconnection topics
    #[must_use]
    pub fn announcement(&self) -> serde_json::Value {
        serde_json::json!({
            "uid": self.uid,
            "siteId": self.site_name,
        })
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.uid, self.site_name)
    }
}
