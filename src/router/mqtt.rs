//! MQTT bus backed by `rumqttc`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter, TlsConfiguration,
    Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::bus::{Bus, BusKind, Inbound};
use crate::config::BusConfig;
use crate::{Error, Result};

/// Requests buffered between the client handle and its event loop
const CLIENT_CAPACITY: usize = 64;

const KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Pause between reconnection attempts of the event loop
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// One MQTT broker connection
pub struct MqttBus {
    kind: BusKind,
    client_id: String,
    connection: Mutex<Option<Connection>>,
    connected: Arc<watch::Sender<bool>>,
}

struct Connection {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

impl MqttBus {
    /// Create a disconnected bus
    #[must_use]
    pub fn new(kind: BusKind) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            kind,
            client_id: format!("beacon-satellite-{kind}-{}", uuid::Uuid::new_v4().simple()),
            connection: Mutex::new(None),
            connected: Arc::new(connected),
        }
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn client(&self) -> Option<AsyncClient> {
        self.connection().as_ref().map(|c| c.client.clone())
    }

    async fn options(&self, config: &BusConfig) -> Result<MqttOptions> {
        let mut options = MqttOptions::new(&self.client_id, &config.host, config.port);
        options.set_keep_alive(KEEP_ALIVE);

        if let Some((user, pass)) = config.credentials() {
            options.set_credentials(user, pass);
        }

        if let Some(ca_file) = &config.tls_ca_file {
            let ca = tokio::fs::read(ca_file).await.map_err(|e| {
                Error::Bus(format!("cannot read tls file {}: {e}", ca_file.display()))
            })?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }

        Ok(options)
    }
}

#[async_trait]
impl Bus for MqttBus {
    fn kind(&self) -> BusKind {
        self.kind
    }

    async fn connect(
        &self,
        config: &BusConfig,
        filters: &[String],
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<()> {
        self.disconnect().await?;

        let options = self.options(config).await?;
        let (client, event_loop) = AsyncClient::new(options, CLIENT_CAPACITY);

        let task = tokio::spawn(drive(
            self.kind,
            event_loop,
            client.clone(),
            filters.to_vec(),
            inbound,
            Arc::clone(&self.connected),
        ));

        *self.connection() = Some(Connection {
            client,
            event_loop: task,
        });

        tracing::info!(bus = %self.kind, host = %config.host, port = config.port, "connecting");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self
            .client()
            .ok_or_else(|| Error::Bus(format!("{} bus is not connected", self.kind)))?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let connection = self.connection().take();
        let Some(connection) = connection else {
            return Ok(());
        };

        if let Err(e) = connection.client.disconnect().await {
            tracing::debug!(bus = %self.kind, error = %e, "disconnect request not delivered");
        }
        connection.event_loop.abort();
        self.connected.send_replace(false);

        tracing::info!(bus = %self.kind, "disconnected");
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

/// Poll the event loop, re-subscribing on every broker acknowledgement
async fn drive(
    kind: BusKind,
    mut event_loop: EventLoop,
    client: AsyncClient,
    filters: Vec<String>,
    inbound: mpsc::Sender<Inbound>,
    connected: Arc<watch::Sender<bool>>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.send_replace(true);
                tracing::info!(bus = %kind, "connected");

                if !filters.is_empty() {
                    let subscriptions = filters
                        .iter()
                        .map(|filter| SubscribeFilter::new(filter.clone(), QoS::AtMostOnce));
                    if let Err(e) = client.try_subscribe_many(subscriptions) {
                        tracing::warn!(bus = %kind, error = %e, "failed to subscribe");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Inbound {
                    bus: kind,
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if inbound.send(message).await.is_err() {
                    tracing::debug!(bus = %kind, "router gone, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected.send_replace(false);
            }
            Ok(_) => {}
            Err(e) => {
                if connected.send_replace(false) {
                    tracing::warn!(bus = %kind, error = %e, "connection lost");
                } else {
                    tracing::debug!(bus = %kind, error = %e, "connection attempt failed");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    connected.send_replace(false);
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("kind", &self.kind)
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}
