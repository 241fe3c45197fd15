//! Message router
//!
//! Multiplexes the remote (hub) bus and the local (loopback) bus onto one
//! dispatch surface. Every inbound message is checked against the device
//! identity before anything else looks at it, then handed either to a
//! dedicated handler or to the generic broadcast.
//!
//! The identity is read from the shared configuration the first time it is
//! needed, so the router can be built before pairing has produced one.

mod bus;
mod mqtt;
mod payload;
pub mod topics;

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use bus::{Bus, BusKind, Inbound};
pub use mqtt::MqttBus;
pub use payload::Payload;

use crate::config::{BusConfig, SharedConfig};
use crate::{Error, Result};
use crate::kernel::{EventFlag, Kernel};
use crate::pairing::{DeviceIdentity, HeartbeatClock, PairingHandle, Trigger};
use crate::registry::{Broadcaster, Component, SatelliteEvent, Stage};

/// Inbound messages buffered between the buses and the dispatcher
const INBOUND_CAPACITY: usize = 256;

/// Broadcast origin of router events
const ORIGIN: &str = "router";

/// Upper bound on waiting for a broker to acknowledge a new connection
const CONNECT_WAIT: Duration = Duration::from_secs(5);

/// Kernel flag: audio goes to the local bus when set, to the hub otherwise
pub const BROADCAST_LOCAL: &str = "broadcast_local";

/// Kernel flag: do-not-disturb engaged
pub const DND: &str = "dnd";

/// What to do with a message on a subscribed topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    ConnectionAccepted,
    ConnectionRefused,
    CoreHeartbeat,
    CoreDisconnection,
    CoreReconnection,
    HotwordToggleOn,
    HotwordToggleOff,
    NewHotword,
    DndOn,
    DndOff,
    DndToggle,
    PlayBytes,
    HotwordDetected,
    AudioFrame,
    Broadcast,
}

impl Route {
    /// Binary routes are addressed through their topic, not their payload
    const fn is_binary(self) -> bool {
        matches!(self, Self::PlayBytes | Self::AudioFrame)
    }
}

type RouteTable = Vec<(String, Route)>;

fn remote_routes(uid: &str) -> RouteTable {
    vec![
        (topics::CONNECTION_ACCEPTED.to_string(), Route::ConnectionAccepted),
        (topics::CONNECTION_REFUSED.to_string(), Route::ConnectionRefused),
        (topics::CORE_HEARTBEAT.to_string(), Route::CoreHeartbeat),
        (topics::CORE_DISCONNECTION.to_string(), Route::CoreDisconnection),
        (topics::CORE_RECONNECTION.to_string(), Route::CoreReconnection),
        (topics::HOTWORD_TOGGLE_ON.to_string(), Route::HotwordToggleOn),
        (topics::HOTWORD_TOGGLE_OFF.to_string(), Route::HotwordToggleOff),
        (topics::NEW_HOTWORD.to_string(), Route::NewHotword),
        (topics::DND_ON.to_string(), Route::DndOn),
        (topics::DND_OFF.to_string(), Route::DndOff),
        (topics::DND_TOGGLE.to_string(), Route::DndToggle),
        (topics::play_bytes(uid), Route::PlayBytes),
        (topics::ASR_START_LISTENING.to_string(), Route::Broadcast),
        (topics::ASR_STOP_LISTENING.to_string(), Route::Broadcast),
        (topics::LEDS_CLEAR.to_string(), Route::Broadcast),
        (topics::LEDS_DND.to_string(), Route::Broadcast),
    ]
}

fn local_routes(uid: &str) -> RouteTable {
    vec![
        (topics::HOTWORD_DETECTED.to_string(), Route::HotwordDetected),
        (topics::audio_frame(uid), Route::AudioFrame),
    ]
}

/// Identity and subscription tables, fixed for the life of the router
struct Routes {
    identity: DeviceIdentity,
    remote: RouteTable,
    local: RouteTable,
}

impl Routes {
    fn new(identity: DeviceIdentity, extra: &[(BusKind, String)]) -> Self {
        let uid = identity.uid.as_str();
        let mut remote = remote_routes(uid);
        let mut local = local_routes(uid);
        for (kind, filter) in extra {
            match kind {
                BusKind::Remote => remote.push((filter.clone(), Route::Broadcast)),
                BusKind::Local => local.push((filter.clone(), Route::Broadcast)),
            }
        }
        Self {
            identity,
            remote,
            local,
        }
    }

    fn table(&self, kind: BusKind) -> &RouteTable {
        match kind {
            BusKind::Remote => &self.remote,
            BusKind::Local => &self.local,
        }
    }
}

/// Everything the router is wired to
pub struct RouterContext {
    pub config: SharedConfig,
    pub remote: Arc<dyn Bus>,
    pub local: Arc<dyn Bus>,
    pub pairing: PairingHandle,
    pub heartbeat: HeartbeatClock,
    pub broadcaster: Broadcaster,
    pub kernel: Kernel,
    /// Extra subscriptions delivered through the generic broadcast
    pub extra_subscriptions: Vec<(BusKind, String)>,
}

/// Cloneable handle to the message router
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<Inner>,
}

struct Inner {
    config: SharedConfig,
    remote: Arc<dyn Bus>,
    local: Arc<dyn Bus>,
    extra_subscriptions: Vec<(BusKind, String)>,
    routes: OnceLock<Routes>,
    pairing: PairingHandle,
    heartbeat: HeartbeatClock,
    broadcaster: Broadcaster,
    broadcast_local: EventFlag,
    dnd: EventFlag,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MessageRouter {
    /// Build an unconnected router
    #[must_use]
    pub fn new(context: RouterContext) -> Self {
        let broadcast_local = context.kernel.new_event(BROADCAST_LOCAL, None, None);
        broadcast_local.set();
        let dnd = context.kernel.new_event(DND, None, None);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config: context.config,
                remote: context.remote,
                local: context.local,
                extra_subscriptions: context.extra_subscriptions,
                routes: OnceLock::new(),
                pairing: context.pairing,
                heartbeat: context.heartbeat,
                broadcaster: context.broadcaster,
                broadcast_local,
                dnd,
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Identity messages are filtered against
    ///
    /// None until the configuration holds a paired identity.
    #[must_use]
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.routes().map(|routes| &routes.identity)
    }

    /// Subscription filters of one bus, in table order
    ///
    /// Empty until an identity is known.
    #[must_use]
    pub fn subscriptions(&self, kind: BusKind) -> Vec<String> {
        self.routes().map_or_else(Vec::new, |routes| {
            routes
                .table(kind)
                .iter()
                .map(|(filter, _)| filter.clone())
                .collect()
        })
    }

    /// Routing tables, built from the configured identity on first use
    fn routes(&self) -> Option<&Routes> {
        if let Some(routes) = self.inner.routes.get() {
            return Some(routes);
        }

        let identity = self
            .inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .identity()?;
        Some(
            self.inner
                .routes
                .get_or_init(|| Routes::new(identity, &self.inner.extra_subscriptions)),
        )
    }

    fn bus(&self, kind: BusKind) -> &Arc<dyn Bus> {
        match kind {
            BusKind::Remote => &self.inner.remote,
            BusKind::Local => &self.inner.local,
        }
    }

    fn bus_config(&self, kind: BusKind) -> BusConfig {
        let config = self.inner.config.read().unwrap_or_else(|e| e.into_inner());
        match kind {
            BusKind::Remote => config.bus.clone(),
            BusKind::Local => config.local_bus.clone(),
        }
    }

    // Connection management

    /// Connect both buses with the current configuration
    ///
    /// Starts the inbound dispatcher on first use. Returns once both brokers
    /// have acknowledged the connection, or after a bounded wait; a broker
    /// that has not answered by then keeps being retried in the background.
    ///
    /// # Errors
    ///
    /// Returns error if no device identity is configured, or if a bus cannot
    /// be set up (the other bus is still tried)
    pub async fn connect(&self) -> Result<()> {
        if self.routes().is_none() {
            return Err(Error::Config(
                "cannot route messages without a device identity".to_string(),
            ));
        }
        self.start_pump();

        let (remote, local) = tokio::join!(
            self.connect_bus(BusKind::Remote),
            self.connect_bus(BusKind::Local)
        );
        remote.and(local)
    }

    async fn connect_bus(&self, kind: BusKind) -> Result<()> {
        let config = self.bus_config(kind);
        let bus = self.bus(kind);
        if let Err(e) = bus
            .connect(&config, &self.subscriptions(kind), self.inner.inbound_tx.clone())
            .await
        {
            tracing::warn!(bus = %kind, host = %config.host, error = %e, "failed to connect");
            return Err(e);
        }

        let mut state = bus.connection_state();
        let acknowledged = tokio::time::timeout(CONNECT_WAIT, state.wait_for(|up| *up))
            .await
            .map(|changed| changed.is_ok());
        match acknowledged {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(bus = %kind, "connection state went away");
            }
            Err(_) => {
                tracing::warn!(
                    bus = %kind,
                    host = %config.host,
                    wait = ?CONNECT_WAIT,
                    "broker has not acknowledged the connection yet"
                );
            }
        }
        Ok(())
    }

    /// Drop and re-establish both connections with fresh configuration
    ///
    /// # Errors
    ///
    /// Returns error if a bus cannot be set up again
    pub async fn reconnect(&self) -> Result<()> {
        tracing::info!("reconnecting buses");
        self.disconnect().await;
        self.connect().await
    }

    /// Disconnect both buses; safe to call repeatedly
    pub async fn disconnect(&self) {
        for kind in [BusKind::Remote, BusKind::Local] {
            if let Err(e) = self.bus(kind).disconnect().await {
                tracing::debug!(bus = %kind, error = %e, "disconnect failed");
            }
        }
    }

    fn start_pump(&self) {
        let rx = self
            .inner
            .inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut rx) = rx else {
            return;
        };

        // Weak: the pump ends with the last router handle
        let inner = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Self { inner }.dispatch(message);
            }
        });

        *self.inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
    }

    fn stop_pump(&self) {
        let pump = self.inner.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }

    // Publishing

    /// Publish on the remote bus; failures are logged and swallowed
    pub async fn publish(&self, topic: &str, payload: impl Into<Payload> + Send) {
        self.publish_on(BusKind::Remote, topic, payload.into()).await;
    }

    /// Publish on the local bus; failures are logged and swallowed
    pub async fn local_publish(&self, topic: &str, payload: impl Into<Payload> + Send) {
        self.publish_on(BusKind::Local, topic, payload.into()).await;
    }

    /// Publish where audio listeners currently are
    ///
    /// Local bus while local wakeword detection is on, the hub otherwise.
    pub async fn publish_to_listener(&self, topic: &str, payload: impl Into<Payload> + Send) {
        let kind = if self.inner.broadcast_local.is_set() {
            BusKind::Local
        } else {
            BusKind::Remote
        };
        self.publish_on(kind, topic, payload.into()).await;
    }

    async fn publish_on(&self, kind: BusKind, topic: &str, payload: Payload) {
        let bus = self.bus(kind);
        if !bus.is_connected() {
            tracing::warn!(bus = %kind, topic, "bus not connected, message dropped");
            return;
        }

        let bytes = match payload.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(bus = %kind, topic, error = %e, "cannot serialize payload");
                return;
            }
        };

        if let Err(e) = bus.publish(topic, bytes).await {
            tracing::warn!(bus = %kind, topic, error = %e, "publish failed");
        }
    }

    // Inbound

    /// Filter and route one inbound message
    pub fn dispatch(&self, message: Inbound) {
        let Some(routes) = self.routes() else {
            tracing::trace!(topic = %message.topic, "no identity yet, message dropped");
            return;
        };

        let route = routes
            .table(message.bus)
            .iter()
            .find(|(filter, _)| topics::topic_matches(filter, &message.topic))
            .map_or(Route::Broadcast, |(_, route)| *route);

        let Inbound {
            bus,
            topic,
            payload,
        } = message;

        let payload = if route.is_binary() {
            Payload::Binary(payload)
        } else {
            Payload::decode(&payload)
        };

        let target = if route.is_binary() {
            topics::audio_server_uid(&topic)
        } else {
            payload.target()
        };
        if let Some(target) = target
            && !routes.identity.is_addressed_by(target)
        {
            tracing::trace!(%bus, topic, target, "message for another device dropped");
            return;
        }

        self.route(route, &routes.identity, topic, payload);
    }

    fn route(&self, route: Route, identity: &DeviceIdentity, topic: String, payload: Payload) {
        let inner = &self.inner;
        let broadcast = |event| inner.broadcaster.broadcast(event, ORIGIN);

        match route {
            Route::ConnectionAccepted => inner.pairing.trigger(Trigger::ConnectionAccepted),
            Route::ConnectionRefused => inner.pairing.trigger(Trigger::ConnectionRefused),
            Route::CoreHeartbeat => inner.heartbeat.beat(),
            Route::CoreDisconnection => inner.pairing.trigger(Trigger::HubDisconnected),
            Route::CoreReconnection => inner.pairing.trigger(Trigger::HubReconnected),
            Route::HotwordToggleOn => {
                inner.broadcast_local.set();
                broadcast(SatelliteEvent::HotwordToggleOn);
            }
            Route::HotwordToggleOff => {
                inner.broadcast_local.clear();
                broadcast(SatelliteEvent::HotwordToggleOff);
            }
            Route::NewHotword => broadcast(SatelliteEvent::NewHotword(payload)),
            Route::DndOn => self.set_dnd(true),
            Route::DndOff => self.set_dnd(false),
            Route::DndToggle => self.set_dnd(!inner.dnd.is_set()),
            Route::PlayBytes => {
                let request_id = topics::play_bytes_request_id(&topic)
                    .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string);
                let Payload::Binary(audio) = payload else {
                    return;
                };
                broadcast(SatelliteEvent::PlayBytes {
                    uid: identity.uid.clone(),
                    request_id,
                    audio,
                });
            }
            Route::HotwordDetected => broadcast(SatelliteEvent::HotwordDetected(payload)),
            Route::AudioFrame => {
                let Payload::Binary(frame) = payload else {
                    return;
                };
                broadcast(SatelliteEvent::AudioFrame {
                    uid: identity.uid.clone(),
                    frame,
                });
            }
            Route::Broadcast => broadcast(SatelliteEvent::Message { topic, payload }),
        }
    }

    fn set_dnd(&self, on: bool) {
        let inner = &self.inner;
        if on {
            inner.dnd.set();
            inner.broadcaster.broadcast(SatelliteEvent::DndOn, ORIGIN);
        } else {
            inner.dnd.clear();
            inner.broadcaster.broadcast(SatelliteEvent::DndOff, ORIGIN);
        }
    }

    /// Whether do-not-disturb is engaged
    #[must_use]
    pub fn is_dnd(&self) -> bool {
        self.inner.dnd.is_set()
    }

    /// Acknowledge a finished play-bytes request to the hub
    async fn play_bytes_finished(&self, request_id: &str, session_id: Option<&str>) {
        let Some(identity) = self.identity() else {
            return;
        };
        let uid = identity.uid.as_str();
        self.publish(
            &topics::play_finished(uid),
            serde_json::json!({ "id": request_id, "sessionId": session_id }),
        )
        .await;
        self.publish(
            topics::TTS_FINISHED,
            serde_json::json!({ "id": request_id, "sessionId": session_id, "siteId": uid }),
        )
        .await;
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("identity", &self.inner.routes.get().map(|r| &r.identity))
            .field("remote_connected", &self.inner.remote.is_connected())
            .field("local_connected", &self.inner.local.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Component for MessageRouter {
    fn name(&self) -> &str {
        ORIGIN
    }

    fn stage(&self) -> Stage {
        Stage::Router
    }

    async fn on_start(&self) -> Result<()> {
        self.connect().await
    }

    async fn on_stop(&self) -> Result<()> {
        self.disconnect().await;
        self.stop_pump();
        Ok(())
    }

    async fn on_event(&self, event: &SatelliteEvent) -> Result<()> {
        if let SatelliteEvent::PlayBytesFinished {
            request_id,
            session_id,
        } = event
        {
            self.play_bytes_finished(request_id, session_id.as_deref())
                .await;
        }
        Ok(())
    }
}
