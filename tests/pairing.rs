//! Pairing lifecycle tests
//!
//! Runs a whole satellite against in-memory buses and drives it with the
//! messages a hub would send.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use beacon_satellite::config::{SatelliteConfigFile, load_config_file};
use beacon_satellite::kernel::Kernel;
use beacon_satellite::pairing::{PairingHandle, PairingState};
use beacon_satellite::registry::{Broadcaster, SatelliteEvent};
use beacon_satellite::router::{Bus, BusKind, topics};
use beacon_satellite::{Config, Error, Satellite};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

mod common;
use common::{MemoryBus, Recorder, config_in, eventually, paired_config};

/// A satellite running in the background
struct Running {
    pairing: PairingHandle,
    kernel: Kernel,
    broadcaster: Broadcaster,
    remote: Arc<MemoryBus>,
    local: Arc<MemoryBus>,
    recorder: Arc<Recorder>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<beacon_satellite::Result<()>>,
}

impl Running {
    fn start(config: Config) -> Self {
        Self::start_with(
            config,
            MemoryBus::new(BusKind::Remote),
            MemoryBus::new(BusKind::Local),
        )
    }

    fn start_with(config: Config, remote: Arc<MemoryBus>, local: Arc<MemoryBus>) -> Self {
        let recorder = Recorder::new();

        let satellite = Satellite::with_buses(config, remote.clone(), local.clone())
            .component(recorder.clone());
        let pairing = satellite.pairing();
        let kernel = satellite.kernel().clone();
        let broadcaster = satellite.broadcaster();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(satellite.run(async move {
            let _ = stopped.await;
        }));

        Self {
            pairing,
            kernel,
            broadcaster,
            remote,
            local,
            recorder,
            stop,
            task,
        }
    }

    async fn reach(&self, state: PairingState, within: Duration) {
        let reached = tokio::time::timeout(within, self.pairing.wait_for(state))
            .await
            .unwrap_or_else(|_| panic!("{state} not reached, still {}", self.pairing.state()));
        assert!(reached, "pairing machine stopped before {state}");
    }

    fn greetings(&self) -> usize {
        self.remote.published_on(topics::GREETING).len()
    }

    fn transitions(&self) -> Vec<(PairingState, PairingState)> {
        self.recorder
            .events()
            .into_iter()
            .filter_map(|event| match event {
                SatelliteEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    async fn accept(&self) {
        assert!(
            self.remote
                .inject_json(topics::CONNECTION_ACCEPTED, json!({ "uid": "abc123" }))
                .await
        );
        self.reach(PairingState::Registered, Duration::from_secs(5))
            .await;
    }

    async fn shutdown(self) -> beacon_satellite::Result<()> {
        let _ = self.stop.send(());
        self.task.await.unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn resumes_persisted_identity_without_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));

    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;
    eventually(Duration::from_secs(1), || satellite.greetings() == 1).await;

    assert_eq!(
        satellite.remote.json_on(topics::GREETING)[0],
        json!({ "uid": "abc123", "siteId": "kitchen" })
    );
    assert!(
        !satellite
            .transitions()
            .iter()
            .any(|(_, to)| *to == PairingState::New)
    );
    assert!(satellite.remote.filters().contains(&topics::CONNECTION_ACCEPTED.to_string()));
    assert!(satellite.local.filters().contains(&topics::HOTWORD_DETECTED.to_string()));

    satellite.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unanswered_greetings_go_dormant_then_retry() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));

    satellite
        .reach(PairingState::Dormant, Duration::from_secs(60))
        .await;
    assert_eq!(satellite.greetings(), 5);
    assert!(satellite.kernel.has_pending_timer("dormant_retry"));

    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(400))
        .await;
    eventually(Duration::from_secs(1), || satellite.greetings() == 6).await;

    satellite.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_broker_acknowledgement_loses_no_greeting() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start_with(
        paired_config(dir.path()),
        MemoryBus::delayed(BusKind::Remote, Duration::from_secs(2)),
        MemoryBus::delayed(BusKind::Local, Duration::from_millis(300)),
    );

    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(10))
        .await;
    assert!(satellite.remote.is_connected());
    eventually(Duration::from_secs(1), || satellite.greetings() == 1).await;

    satellite
        .reach(PairingState::Dormant, Duration::from_secs(60))
        .await;
    assert_eq!(satellite.greetings(), 5);

    satellite.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn accepted_greeting_starts_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;

    satellite.accept().await;
    assert!(satellite.kernel.is_thread_alive("heartbeat"));
    assert!(!satellite.kernel.has_pending_timer("greeting_retry"));

    // The hub keeps beating, the session survives well past the timeout
    for _ in 0..12 {
        assert!(
            satellite
                .remote
                .inject(topics::CORE_HEARTBEAT, b"{}".to_vec())
                .await
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(satellite.pairing.state(), PairingState::Registered);
    assert_eq!(satellite.greetings(), 1);

    let beats = satellite.remote.json_on(topics::DEVICE_HEARTBEAT);
    assert!(beats.len() >= 5, "only {} heartbeats", beats.len());
    assert_eq!(beats[0], json!({ "uid": "abc123", "siteId": "kitchen" }));

    satellite.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_hub_disconnects_then_reconnection_registers_again() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;
    satellite.accept().await;

    satellite
        .reach(PairingState::Disconnected, Duration::from_secs(30))
        .await;
    let kernel = satellite.kernel.clone();
    eventually(Duration::from_secs(3), || !kernel.is_thread_alive("heartbeat")).await;

    // Supervision is over, staying silent longer changes nothing
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(satellite.pairing.state(), PairingState::Disconnected);

    let disconnections = satellite
        .transitions()
        .iter()
        .filter(|(_, to)| *to == PairingState::Disconnected)
        .count();
    assert_eq!(disconnections, 1);

    assert!(
        satellite
            .remote
            .inject(topics::CORE_RECONNECTION, b"{}".to_vec())
            .await
    );
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;
    eventually(Duration::from_secs(1), || satellite.greetings() == 2).await;

    satellite.accept().await;
    assert!(satellite.kernel.is_thread_alive("heartbeat"));

    satellite.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn hub_disconnection_stops_supervision() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;
    satellite.accept().await;

    assert!(
        satellite
            .remote
            .inject(topics::CORE_DISCONNECTION, b"{}".to_vec())
            .await
    );
    satellite
        .reach(PairingState::Disconnected, Duration::from_secs(1))
        .await;
    assert!(!satellite.kernel.is_thread_alive("heartbeat"));

    satellite.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn messages_for_other_devices_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;

    satellite
        .remote
        .inject_json(topics::CONNECTION_ACCEPTED, json!({ "uid": "other" }))
        .await;
    satellite
        .remote
        .inject_json(topics::CONNECTION_REFUSED, json!({ "siteId": "other" }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(satellite.pairing.state(), PairingState::WaitingReply);

    // Without a uid the site id is used as the target
    satellite
        .remote
        .inject_json(topics::CONNECTION_ACCEPTED, json!({ "siteId": "abc123" }))
        .await;
    satellite
        .reach(PairingState::Registered, Duration::from_secs(1))
        .await;

    satellite.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn refusal_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;

    satellite
        .remote
        .inject_json(topics::CONNECTION_REFUSED, json!({ "uid": "abc123" }))
        .await;

    let Running {
        pairing,
        remote,
        task,
        ..
    } = satellite;
    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(Error::Refused)));
    assert_eq!(pairing.state(), PairingState::Refused);
    assert_eq!(remote.published_on(topics::DISCONNECTING).len(), 1);
    assert!(!remote.is_connected());
}

#[tokio::test(start_paused = true)]
async fn shutdown_announces_disconnection() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;
    satellite.accept().await;

    let remote = satellite.remote.clone();
    let kernel = satellite.kernel.clone();
    satellite.shutdown().await.unwrap();

    assert_eq!(
        remote.json_on(topics::DISCONNECTING),
        [json!({ "uid": "abc123", "siteId": "kitchen" })]
    );
    assert!(!remote.is_connected());
    assert!(!kernel.is_thread_alive("heartbeat"));
    assert!(!kernel.is_thread_alive("clock"));
}

#[tokio::test(start_paused = true)]
async fn play_bytes_is_routed_and_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;

    let audio = vec![0_u8, 159, 146, 150, 255];
    assert!(
        satellite
            .remote
            .inject("hermes/audioServer/abc123/playBytes/req-1", audio.clone())
            .await
    );

    let recorder = satellite.recorder.clone();
    eventually(Duration::from_secs(1), || {
        recorder.events().contains(&SatelliteEvent::PlayBytes {
            uid: "abc123".to_string(),
            request_id: "req-1".to_string(),
            audio: audio.clone(),
        })
    })
    .await;

    satellite.broadcaster.broadcast(
        SatelliteEvent::PlayBytesFinished {
            request_id: "req-1".to_string(),
            session_id: Some("s1".to_string()),
        },
        "speaker",
    );

    let remote = satellite.remote.clone();
    eventually(Duration::from_secs(1), || {
        !remote.published_on(topics::TTS_FINISHED).is_empty()
    })
    .await;
    assert_eq!(
        remote.json_on(&topics::play_finished("abc123")),
        [json!({ "id": "req-1", "sessionId": "s1" })]
    );
    assert_eq!(
        remote.json_on(topics::TTS_FINISHED),
        [json!({ "id": "req-1", "sessionId": "s1", "siteId": "abc123" })]
    );
    assert!(satellite.local.published_on(topics::TTS_FINISHED).is_empty());

    satellite.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dnd_toggles() {
    let dir = tempfile::tempdir().unwrap();
    let satellite = Running::start(paired_config(dir.path()));
    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(5))
        .await;

    let dnd = satellite.kernel.get_event("dnd");
    assert!(!dnd.is_set());

    satellite.remote.inject(topics::DND_TOGGLE, Vec::new()).await;
    eventually(Duration::from_secs(1), || dnd.is_set()).await;

    satellite.remote.inject(topics::DND_TOGGLE, Vec::new()).await;
    eventually(Duration::from_secs(1), || !dnd.is_set()).await;

    let recorder = satellite.recorder.clone();
    eventually(Duration::from_secs(1), || {
        let events = recorder.events();
        let on = events.iter().position(|e| *e == SatelliteEvent::DndOn);
        let off = events.iter().position(|e| *e == SatelliteEvent::DndOff);
        matches!((on, off), (Some(on), Some(off)) if on < off)
    })
    .await;

    satellite.shutdown().await.unwrap();
}

#[tokio::test]
async fn discovers_pairs_and_registers() {
    let dir = tempfile::tempdir().unwrap();

    let udp_port = {
        let probe = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap().port()
    };
    let mut file = SatelliteConfigFile::default();
    file.device.site_name = Some("kitchen".to_string());
    file.pairing.broadcast_port = Some(udp_port);
    file.pairing.receive_timeout_ms = Some(500);
    file.pairing.max_cycles = Some(10);
    file.pairing.local_ip = Some("192.168.1.10".to_string());
    let config = config_in(dir.path(), &file);
    let path = config.path.clone();

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let tcp_port = listener.local_addr().unwrap().port();
    let hub = tokio::spawn(async move {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let satellite = SocketAddr::from((Ipv4Addr::LOCALHOST, udp_port));
        let announcement = format!("pair:127.0.0.1:{tcp_port}:abc123");

        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        let (mut stream, _) = loop {
            tokio::select! {
                accepted = listener.accept() => break accepted.unwrap(),
                _ = ticker.tick() => {
                    let _ = socket.send_to(announcement.as_bytes(), satellite).await;
                }
            }
        };

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        socket.send_to(b"ok", satellite).await.unwrap();
        reply
    });

    let satellite = Running::start(config);
    let reply = tokio::time::timeout(Duration::from_secs(10), hub)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "192.168.1.10:Satellite");

    satellite
        .reach(PairingState::WaitingReply, Duration::from_secs(10))
        .await;
    eventually(Duration::from_secs(1), || satellite.greetings() == 1).await;
    satellite.accept().await;

    // Transitions raised by discovery wait until every component has started
    let recorder = satellite.recorder.clone();
    assert_eq!(recorder.events_before_start(), 0);
    eventually(Duration::from_secs(1), || {
        recorder
            .events()
            .contains(&SatelliteEvent::StateChanged {
                from: PairingState::WaitingReply,
                to: PairingState::Registered,
            })
    })
    .await;
    assert_eq!(
        satellite.transitions(),
        [
            (PairingState::Booting, PairingState::New),
            (PairingState::New, PairingState::Accepted),
            (PairingState::Accepted, PairingState::WaitingReply),
            (PairingState::WaitingReply, PairingState::Registered),
        ]
    );

    let saved = load_config_file(&path);
    assert_eq!(saved.device.uid.as_deref(), Some("abc123"));
    assert_eq!(saved.bus.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(saved.device.site_name.as_deref(), Some("kitchen"));

    satellite.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_discovery_is_fatal() {
    let dir = tempfile::tempdir().unwrap();

    let mut file = SatelliteConfigFile::default();
    file.pairing.broadcast_port = Some(0);
    file.pairing.receive_timeout_ms = Some(50);
    file.pairing.max_cycles = Some(2);
    let satellite = Running::start(config_in(dir.path(), &file));

    let recorder = satellite.recorder.clone();
    let Running {
        pairing,
        remote,
        task,
        ..
    } = satellite;
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(Error::Discovery(_))));
    assert!(result.unwrap_err().is_fatal());
    assert_eq!(pairing.state(), PairingState::Error);
    assert_eq!(remote.connects(), 0);

    // Collaborators still learn why the satellite stopped, then get stopped
    assert_eq!(
        recorder.events(),
        [
            SatelliteEvent::StateChanged {
                from: PairingState::Booting,
                to: PairingState::New,
            },
            SatelliteEvent::StateChanged {
                from: PairingState::New,
                to: PairingState::Error,
            },
        ]
    );
    assert!(recorder.was_stopped());
}
