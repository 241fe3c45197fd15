//! Pairing states

use serde::{Deserialize, Serialize};

/// Where the satellite stands with its hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    /// Process just started
    #[default]
    Booting,
    /// No identity yet, discovery running
    New,
    /// Greeting sent, waiting for the hub verdict
    WaitingReply,
    /// Discovery handshake succeeded
    Accepted,
    /// Hub accepted the greeting, heartbeats flowing
    Registered,
    /// Hub refused the greeting
    Refused,
    /// Hub heartbeats stopped or the hub announced its disconnection
    Disconnected,
    /// Greeting attempts exhausted, waiting before the next cycle
    Dormant,
    /// Discovery failed
    Error,
}

impl PairingState {
    /// Whether this state ends the process
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Refused | Self::Error)
    }

    /// Stable lower-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "booting",
            Self::New => "new",
            Self::WaitingReply => "waiting_reply",
            Self::Accepted => "accepted",
            Self::Registered => "registered",
            Self::Refused => "refused",
            Self::Disconnected => "disconnected",
            Self::Dormant => "dormant",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for PairingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
