//! Hub pairing and liveness
//!
//! Discovery, greeting, registration and heartbeat supervision of the hub
//! session, driven by a single-writer state machine.

pub mod discovery;
mod heartbeat;
mod identity;
mod machine;
mod service;
mod state;

pub use discovery::{Announcement, Discovery, DiscoverySettings, discover};
pub use heartbeat::{HeartbeatClock, HeartbeatMonitor, clock};
pub use identity::{DEFAULT_SITE_NAME, DeviceIdentity};
pub use machine::{PairingHandle, PairingStateMachine, PairingTiming, Trigger};
pub use service::{MachineSlot, PairingBoot, PairingService};
pub use state::PairingState;
