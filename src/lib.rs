//! Beacon Satellite - control plane of a voice assistant satellite
//!
//! This library pairs a satellite with its hub and keeps the session alive:
//! - Hub discovery over a UDP/TCP handshake
//! - Greeting, registration and heartbeat supervision
//! - Message routing between the hub bus and the local bus
//! - Named timers, tasks and flags shared by all of the above
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Collaborators                       │
//! │   Audio  │  Wakeword  │  LEDs  │  Skills  │  ...    │
//! └────────────────────┬────────────────────────────────┘
//!                      │ SatelliteEvent
//! ┌────────────────────▼────────────────────────────────┐
//! │               Component registry                     │
//! │   Pairing state machine  │  Clock  │  Router         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │     Remote bus (hub)    │    Local bus (loopback)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod kernel;
pub mod pairing;
pub mod registry;
pub mod router;
pub mod satellite;

pub use config::Config;
pub use error::{DiscoveryError, Error, Result};
pub use satellite::Satellite;
