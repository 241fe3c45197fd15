//! Bus topics and MQTT filter matching

/// Satellite greeting, payload is the device identity
pub const GREETING: &str = "projectalice/devices/greeting";
/// Hub accepted the greeting
pub const CONNECTION_ACCEPTED: &str = "projectalice/devices/connectionAccepted";
/// Hub refused the greeting
pub const CONNECTION_REFUSED: &str = "projectalice/devices/connectionRefused";
/// Hub heartbeat
pub const CORE_HEARTBEAT: &str = "projectalice/devices/coreHeartbeat";
/// Hub is going away
pub const CORE_DISCONNECTION: &str = "projectalice/devices/coreDisconnection";
/// Hub is back
pub const CORE_RECONNECTION: &str = "projectalice/devices/coreReconnection";
/// Satellite heartbeat, payload is the device identity
pub const DEVICE_HEARTBEAT: &str = "projectalice/devices/heartbeat";
/// Satellite is going away, payload is the device identity
pub const DISCONNECTING: &str = "projectalice/devices/disconnection";
/// Engage do-not-disturb
pub const DND_ON: &str = "projectalice/devices/stopListen";
/// Release do-not-disturb
pub const DND_OFF: &str = "projectalice/devices/startListen";
/// Toggle do-not-disturb
pub const DND_TOGGLE: &str = "projectalice/devices/toggleListen";
/// A new hotword package is available on the hub
pub const NEW_HOTWORD: &str = "projectalice/devices/alice/newHotword";

pub const HOTWORD_TOGGLE_ON: &str = "hermes/hotword/toggleOn";
pub const HOTWORD_TOGGLE_OFF: &str = "hermes/hotword/toggleOff";
/// Local wakeword detection (local bus)
pub const HOTWORD_DETECTED: &str = "hermes/hotword/default/detected";
pub const ASR_START_LISTENING: &str = "hermes/asr/startListening";
pub const ASR_STOP_LISTENING: &str = "hermes/asr/stopListening";
pub const LEDS_CLEAR: &str = "hermes/leds/clear";
pub const LEDS_DND: &str = "hermes/leds/doNotDisturb";
/// Text-to-speech finished acknowledgement
pub const TTS_FINISHED: &str = "hermes/tts/sayFinished";

const AUDIO_SERVER: &str = "hermes/audioServer";

/// Raw audio frames captured by `uid` (local bus)
#[must_use]
pub fn audio_frame(uid: &str) -> String {
    format!("{AUDIO_SERVER}/{uid}/audioFrame")
}

/// Play-bytes requests addressed to `uid`
#[must_use]
pub fn play_bytes(uid: &str) -> String {
    format!("{AUDIO_SERVER}/{uid}/playBytes/#")
}

/// Play-bytes acknowledgement of `uid`
#[must_use]
pub fn play_finished(uid: &str) -> String {
    format!("{AUDIO_SERVER}/{uid}/playFinished")
}

/// Device uid carried in an audio server topic
#[must_use]
pub fn audio_server_uid(topic: &str) -> Option<&str> {
    let mut levels = topic.split('/');
    match (levels.next(), levels.next(), levels.next()) {
        (Some("hermes"), Some("audioServer"), Some(uid)) if !uid.is_empty() => Some(uid),
        _ => None,
    }
}

/// Request id of a play-bytes topic, the level after `playBytes`
#[must_use]
pub fn play_bytes_request_id(topic: &str) -> Option<&str> {
    let mut levels = topic.split('/').skip_while(|level| *level != "playBytes");
    levels.next()?;
    levels.next().filter(|id| !id.is_empty())
}

/// Whether `topic` matches the MQTT subscription `filter`
///
/// `+` matches exactly one level, a trailing `#` matches the parent level and
/// everything below it.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_matching() {
        assert!(topic_matches(GREETING, GREETING));
        assert!(!topic_matches(GREETING, DEVICE_HEARTBEAT));

        assert!(topic_matches("hermes/+/toggleOn", HOTWORD_TOGGLE_ON));
        assert!(!topic_matches("hermes/+", HOTWORD_TOGGLE_ON));

        let filter = play_bytes("abc");
        assert!(topic_matches(&filter, "hermes/audioServer/abc/playBytes"));
        assert!(topic_matches(&filter, "hermes/audioServer/abc/playBytes/req-1"));
        assert!(!topic_matches(&filter, "hermes/audioServer/other/playBytes/req-1"));

        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/#/b", "a/x/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[test]
    fn uid_from_audio_topics() {
        assert_eq!(audio_server_uid(&audio_frame("abc")), Some("abc"));
        assert_eq!(
            audio_server_uid("hermes/audioServer/abc/playBytes/req"),
            Some("abc")
        );
        assert_eq!(audio_server_uid(GREETING), None);
    }

    #[test]
    fn request_id_from_play_bytes_topic() {
        assert_eq!(
            play_bytes_request_id("hermes/audioServer/abc/playBytes/req-1"),
            Some("req-1")
        );
        assert_eq!(play_bytes_request_id("hermes/audioServer/abc/playBytes"), None);
        assert_eq!(play_bytes_request_id(GREETING), None);
    }
}
