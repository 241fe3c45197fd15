//! Message bus abstraction

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::Result;
use crate::config::BusConfig;

/// Which of the two buses a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// Hub-facing bus
    Remote,
    /// Same-host loopback bus
    Local,
}

impl std::fmt::Display for BusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => f.write_str("remote"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// A message received from a bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub bus: BusKind,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A publish/subscribe connection
#[async_trait]
pub trait Bus: Send + Sync {
    /// Which bus this is
    fn kind(&self) -> BusKind;

    /// Connect with `config`, subscribing `filters` on every (re)connect
    ///
    /// Received messages are pushed into `inbound`. Connecting an already
    /// connected bus replaces the previous connection.
    async fn connect(
        &self,
        config: &BusConfig,
        filters: &[String],
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<()>;

    /// Publish raw bytes
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Drop the connection, a no-op when not connected
    async fn disconnect(&self) -> Result<()>;

    /// Follow the broker connection state
    ///
    /// Flips to true once the broker acknowledges a connection, not when
    /// `connect` returns.
    fn connection_state(&self) -> watch::Receiver<bool>;

    /// Whether the broker connection is currently up
    fn is_connected(&self) -> bool {
        *self.connection_state().borrow()
    }
}
