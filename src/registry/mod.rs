//! Component registry
//!
//! Ordered startup and shutdown of every component, and the typed broadcast
//! used to fan events out to whoever cares about them.

mod event;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use event::SatelliteEvent;

use crate::Result;

/// Startup slot of a component
///
/// Components start in ascending stage order. They stop in descending order,
/// except the router which always stops last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Config,
    Process,
    Discovery,
    Storage,
    Router,
    Pool,
}

impl Stage {
    const fn stop_rank(self) -> u8 {
        match self {
            Self::Pool => 0,
            Self::Storage => 1,
            Self::Discovery => 2,
            Self::Process => 3,
            Self::Config => 4,
            Self::Router => 5,
        }
    }
}

/// A participant in the satellite lifecycle
///
/// Every hook has a no-op default; implement only what the component reacts to.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique component name, used for broadcast exclusion and logs
    fn name(&self) -> &str;

    /// Startup slot
    fn stage(&self) -> Stage {
        Stage::Pool
    }

    /// Called in stage order during startup
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once every component has started
    async fn on_booted(&self) -> Result<()> {
        Ok(())
    }

    /// Called in reverse stage order during shutdown
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Called for every broadcast this component is not excluded from
    async fn on_event(&self, _event: &SatelliteEvent) -> Result<()> {
        Ok(())
    }
}

/// A queued broadcast
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub event: SatelliteEvent,
    pub origin: Option<String>,
    pub exclude: Vec<String>,
}

/// Cloneable handle for broadcasting without holding the registry
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: mpsc::UnboundedSender<Broadcast>,
}

impl Broadcaster {
    /// Create a broadcaster and the receiver the registry drains
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Broadcast>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Broadcast `event` to every component except `origin`
    pub fn broadcast(&self, event: SatelliteEvent, origin: &str) {
        self.send(Broadcast {
            event,
            origin: Some(origin.to_string()),
            exclude: Vec::new(),
        });
    }

    /// Broadcast `event` to every component except `origin` and `exclude`
    pub fn broadcast_excluding(&self, event: SatelliteEvent, origin: &str, exclude: &[&str]) {
        self.send(Broadcast {
            event,
            origin: Some(origin.to_string()),
            exclude: exclude.iter().map(ToString::to_string).collect(),
        });
    }

    fn send(&self, broadcast: Broadcast) {
        if let Err(e) = self.tx.send(broadcast) {
            tracing::debug!(event = %e.0.event, "broadcast dropped, registry is gone");
        }
    }
}

/// Builder collecting components before the registry is frozen
#[derive(Default)]
pub struct RegistryBuilder {
    components: Vec<Arc<dyn Component>>,
}

impl RegistryBuilder {
    /// Add a component
    #[must_use]
    pub fn with(mut self, component: Arc<dyn Component>) -> Self {
        self.components.push(component);
        self
    }

    /// Add a component in place
    pub fn register(&mut self, component: Arc<dyn Component>) {
        self.components.push(component);
    }

    /// Freeze the component list in startup order
    #[must_use]
    pub fn build(mut self) -> ComponentRegistry {
        self.components.sort_by_key(|c| c.stage());
        ComponentRegistry {
            components: self.components.into(),
        }
    }
}

/// Frozen, ordered set of components
#[derive(Clone)]
pub struct ComponentRegistry {
    components: Arc<[Arc<dyn Component>]>,
}

impl ComponentRegistry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Number of registered components
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether no component is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Component names in startup order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    /// Look up a component by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components.iter().find(|c| c.name() == name).cloned()
    }

    /// Start every component in stage order
    ///
    /// A non-fatal startup failure is logged and startup continues.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error raised by a component
    pub async fn start_all(&self) -> Result<()> {
        for component in self.components.iter() {
            tracing::debug!(component = component.name(), stage = ?component.stage(), "starting");
            if let Err(e) = component.on_start().await {
                if e.is_fatal() {
                    tracing::error!(component = component.name(), error = %e, "fatal startup failure");
                    return Err(e);
                }
                tracing::warn!(component = component.name(), error = %e, "failed to start");
            }
        }

        tracing::info!(count = self.components.len(), "all components started");
        Ok(())
    }

    /// Tell every component that startup is complete
    pub async fn booted(&self) {
        for component in self.components.iter() {
            if let Err(e) = component.on_booted().await {
                tracing::warn!(component = component.name(), error = %e, "booted hook failed");
            }
        }
    }

    /// Stop every component, pool first and router last
    ///
    /// Failures are logged and never stop the remaining components.
    pub async fn stop_all(&self) {
        let mut order: Vec<_> = self.components.iter().collect();
        order.sort_by_key(|c| c.stage().stop_rank());

        for component in order {
            tracing::debug!(component = component.name(), "stopping");
            if let Err(e) = component.on_stop().await {
                tracing::warn!(component = component.name(), error = %e, "failed to stop cleanly");
            }
        }

        tracing::info!("all components stopped");
    }

    /// Deliver `event` to every component except `origin` and `exclude`
    ///
    /// A failing component is logged and skipped.
    pub async fn broadcast(&self, event: &SatelliteEvent, origin: Option<&str>, exclude: &[&str]) {
        if !event.is_noisy() {
            tracing::debug!(event = %event, origin, "broadcasting");
        }

        for component in self.components.iter() {
            let name = component.name();
            if origin == Some(name) || exclude.contains(&name) {
                continue;
            }
            if let Err(e) = component.on_event(event).await {
                tracing::warn!(component = name, event = %event, error = %e, "event handler failed");
            }
        }
    }

    async fn deliver(&self, broadcast: &Broadcast) {
        let exclude: Vec<&str> = broadcast.exclude.iter().map(String::as_str).collect();
        self.broadcast(&broadcast.event, broadcast.origin.as_deref(), &exclude)
            .await;
    }

    /// Deliver the broadcasts already queued in `rx`, without waiting for more
    pub async fn deliver_pending(&self, rx: &mut mpsc::UnboundedReceiver<Broadcast>) {
        while let Ok(broadcast) = rx.try_recv() {
            self.deliver(&broadcast).await;
        }
    }

    /// Spawn the task that drains a [`Broadcaster`] channel in order
    ///
    /// Spawn it once startup is done: anything queued before is delivered
    /// first, and no component sees an event before its `on_start`.
    #[must_use]
    pub fn spawn_dispatch(&self, mut rx: mpsc::UnboundedReceiver<Broadcast>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(broadcast) = rx.recv().await {
                registry.deliver(&broadcast).await;
            }
            tracing::debug!("broadcast channel closed");
        })
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names())
            .finish_non_exhaustive()
    }
}
