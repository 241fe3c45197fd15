//! Events fanned out to components

use crate::pairing::PairingState;
use crate::router::Payload;

/// Event broadcast through the component registry
#[derive(Debug, Clone, PartialEq)]
pub enum SatelliteEvent {
    /// The pairing state machine took a transition
    StateChanged {
        from: PairingState,
        to: PairingState,
    },

    /// The hub asked for local wakeword detection to resume
    HotwordToggleOn,

    /// The hub asked for local wakeword detection to stop
    HotwordToggleOff,

    /// The hub published a new hotword package
    NewHotword(Payload),

    /// A local wakeword engine detected the hotword
    HotwordDetected(Payload),

    /// Raw audio captured on the local bus
    AudioFrame { uid: String, frame: Vec<u8> },

    /// The hub asked this device to play audio
    PlayBytes {
        uid: String,
        request_id: String,
        audio: Vec<u8>,
    },

    /// A collaborator finished playing a play-bytes request
    PlayBytesFinished {
        request_id: String,
        session_id: Option<String>,
    },

    /// Do-not-disturb engaged
    DndOn,

    /// Do-not-disturb released
    DndOff,

    FullMinute,
    FiveMinute,
    QuarterHour,
    FullHour,

    /// A subscribed message without a dedicated handler
    Message { topic: String, payload: Payload },
}

impl SatelliteEvent {
    /// Stable name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "stateChanged",
            Self::HotwordToggleOn => "hotwordToggleOn",
            Self::HotwordToggleOff => "hotwordToggleOff",
            Self::NewHotword(_) => "newHotword",
            Self::HotwordDetected(_) => "hotword",
            Self::AudioFrame { .. } => "audioFrame",
            Self::PlayBytes { .. } => "playBytes",
            Self::PlayBytesFinished { .. } => "playBytesFinished",
            Self::DndOn => "dndOn",
            Self::DndOff => "dndOff",
            Self::FullMinute => "fullMinute",
            Self::FiveMinute => "fiveMinute",
            Self::QuarterHour => "quarterHour",
            Self::FullHour => "fullHour",
            Self::Message { .. } => "message",
        }
    }

    /// High-frequency events that are not worth a debug line each
    #[must_use]
    pub const fn is_noisy(&self) -> bool {
        matches!(self, Self::AudioFrame { .. })
    }
}

impl std::fmt::Display for SatelliteEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
