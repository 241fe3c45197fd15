//! Shared test utilities

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_satellite::config::{BusConfig, SatelliteConfigFile, save_config_file};
use beacon_satellite::registry::{Component, SatelliteEvent};
use beacon_satellite::router::{Bus, BusKind, Inbound, topics};
use beacon_satellite::{Config, Error};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// In-memory bus recording everything published on it
pub struct MemoryBus {
    kind: BusKind,
    ack_delay: Option<Duration>,
    connected: Arc<watch::Sender<bool>>,
    state: Mutex<BusState>,
}

#[derive(Default)]
struct BusState {
    connects: usize,
    filters: Vec<String>,
    inbound: Option<mpsc::Sender<Inbound>>,
    published: Vec<(String, Vec<u8>)>,
    pending_ack: Option<JoinHandle<()>>,
}

impl MemoryBus {
    /// A bus whose broker acknowledges every connection immediately
    pub fn new(kind: BusKind) -> Arc<Self> {
        Self::build(kind, None)
    }

    /// A bus whose broker acknowledges every connection only after `delay`
    pub fn delayed(kind: BusKind, delay: Duration) -> Arc<Self> {
        Self::build(kind, Some(delay))
    }

    fn build(kind: BusKind, ack_delay: Option<Duration>) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            kind,
            ack_delay,
            connected: Arc::new(connected),
            state: Mutex::new(BusState::default()),
        })
    }

    /// Deliver a message as if the broker sent it
    ///
    /// Returns false when not connected or no subscription matches `topic`.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        if !self.is_connected() {
            return false;
        }
        let sender = {
            let state = self.state.lock().unwrap();
            let subscribed = state
                .filters
                .iter()
                .any(|filter| topics::topic_matches(filter, topic));
            if !subscribed {
                return false;
            }
            state.inbound.clone()
        };

        let Some(sender) = sender else {
            return false;
        };
        sender
            .send(Inbound {
                bus: self.kind,
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .await
            .is_ok()
    }

    /// Deliver a JSON payload
    pub async fn inject_json(&self, topic: &str, payload: serde_json::Value) -> bool {
        self.inject(topic, payload.to_string()).await
    }

    /// Payloads published on `topic`, oldest first
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// JSON payloads published on `topic`
    pub fn json_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published_on(topic)
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    pub fn filters(&self) -> Vec<String> {
        self.state.lock().unwrap().filters.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }
}

#[async_trait]
impl Bus for MemoryBus {
    fn kind(&self) -> BusKind {
        self.kind
    }

    async fn connect(
        &self,
        _config: &BusConfig,
        filters: &[String],
        inbound: mpsc::Sender<Inbound>,
    ) -> beacon_satellite::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        state.filters = filters.to_vec();
        state.inbound = Some(inbound);
        if let Some(pending) = state.pending_ack.take() {
            pending.abort();
        }

        match self.ack_delay {
            None => {
                self.connected.send_replace(true);
            }
            Some(delay) => {
                self.connected.send_replace(false);
                let connected = Arc::clone(&self.connected);
                state.pending_ack = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    connected.send_replace(true);
                }));
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> beacon_satellite::Result<()> {
        if !self.is_connected() {
            return Err(Error::Bus(format!("{} bus is not connected", self.kind)));
        }
        self.state
            .lock()
            .unwrap()
            .published
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> beacon_satellite::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(pending) = state.pending_ack.take() {
            pending.abort();
        }
        state.inbound = None;
        self.connected.send_replace(false);
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

/// Component recording every event it receives
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<SatelliteEvent>>,
    started: AtomicBool,
    stopped: AtomicBool,
    before_start: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SatelliteEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events delivered before `on_start` ran
    pub fn events_before_start(&self) -> usize {
        self.before_start.load(Ordering::SeqCst)
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Component for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_start(&self) -> beacon_satellite::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_stop(&self) -> beacon_satellite::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_event(&self, event: &SatelliteEvent) -> beacon_satellite::Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            self.before_start.fetch_add(1, Ordering::SeqCst);
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Write `file` to `dir/satellite.toml` and load it without the environment
pub fn config_in(dir: &Path, file: &SatelliteConfigFile) -> Config {
    let path = dir.join("satellite.toml");
    save_config_file(&path, file).unwrap();
    Config::from_file(path, file).unwrap()
}

/// Configuration of a satellite already paired as `abc123@kitchen`
pub fn paired_config(dir: &Path) -> Config {
    let mut file = SatelliteConfigFile::default();
    file.device.uid = Some("abc123".to_string());
    file.device.site_name = Some("kitchen".to_string());
    file.bus.host = Some("10.0.0.5".to_string());
    config_in(dir, &file)
}

/// Poll `condition` until it holds, panicking after `within`
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(within, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
