//! Satellite - the top-level service
//!
//! Wires the kernel, hub discovery, router, pairing state machine and clock
//! into a component registry and runs them until shutdown or a fatal error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::clock::Clock;
use crate::config::{Config, SharedConfig};
use crate::kernel::Kernel;
use crate::pairing::{
    self, HeartbeatClock, MachineSlot, PairingBoot, PairingHandle, PairingService,
    PairingStateMachine, PairingTiming,
};
use crate::registry::{Broadcast, Broadcaster, Component, ComponentRegistry};
use crate::router::{Bus, BusKind, MessageRouter, MqttBus, RouterContext};
use crate::{Error, Result};

/// Bound on waiting for the pairing machine after shutdown
const PAIRING_JOIN_BOUND: Duration = Duration::from_secs(2);

/// The satellite service
pub struct Satellite {
    config: SharedConfig,
    kernel: Kernel,
    broadcaster: Broadcaster,
    broadcasts: mpsc::UnboundedReceiver<Broadcast>,
    machine: PairingStateMachine,
    heartbeat: HeartbeatClock,
    remote: Arc<dyn Bus>,
    local: Arc<dyn Bus>,
    components: Vec<Arc<dyn Component>>,
    subscriptions: Vec<(BusKind, String)>,
}

impl Satellite {
    /// Create a satellite talking MQTT on both buses
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_buses(
            config,
            Arc::new(MqttBus::new(BusKind::Remote)),
            Arc::new(MqttBus::new(BusKind::Local)),
        )
    }

    /// Create a satellite on the given buses
    #[must_use]
    pub fn with_buses(config: Config, remote: Arc<dyn Bus>, local: Arc<dyn Bus>) -> Self {
        let kernel = Kernel::new();
        let (broadcaster, broadcasts) = Broadcaster::channel();
        let (heartbeat, monitor) = pairing::clock();
        let machine = PairingStateMachine::new(kernel.clone(), broadcaster.clone(), monitor);

        Self {
            config: config.into_shared(),
            kernel,
            broadcaster,
            broadcasts,
            machine,
            heartbeat,
            remote,
            local,
            components: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Override greeting and heartbeat timing
    #[must_use]
    pub fn with_timing(mut self, timing: PairingTiming) -> Self {
        self.machine = self.machine.with_timing(timing);
        self
    }

    /// Register a collaborator component
    #[must_use]
    pub fn component(mut self, component: Arc<dyn Component>) -> Self {
        self.components.push(component);
        self
    }

    /// Subscribe an extra topic, delivered to components as a generic message
    #[must_use]
    pub fn subscribe(mut self, bus: BusKind, filter: impl Into<String>) -> Self {
        self.subscriptions.push((bus, filter.into()));
        self
    }

    /// Handle on the pairing state machine
    #[must_use]
    pub fn pairing(&self) -> PairingHandle {
        self.machine.handle()
    }

    /// The concurrency kernel
    #[must_use]
    pub const fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Broadcaster for collaborators built outside the satellite
    #[must_use]
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    /// Shared configuration, updated in place by pairing
    #[must_use]
    pub fn config(&self) -> SharedConfig {
        Arc::clone(&self.config)
    }

    /// Run until `shutdown` resolves or a fatal error occurs
    ///
    /// Discovery runs as a startup stage, so a fatal pairing failure still
    /// reaches every component and is followed by an ordered stop. Events
    /// raised during startup are queued until every component has started.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the satellite
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            config,
            kernel,
            broadcaster,
            mut broadcasts,
            machine,
            heartbeat,
            remote,
            local,
            components,
            subscriptions,
        } = self;

        let handle = machine.handle();
        let router = MessageRouter::new(RouterContext {
            config: Arc::clone(&config),
            remote,
            local,
            pairing: handle.clone(),
            heartbeat,
            broadcaster: broadcaster.clone(),
            kernel: kernel.clone(),
            extra_subscriptions: subscriptions,
        });
        let slot: MachineSlot = Arc::new(Mutex::new(Some(machine)));

        let mut builder = ComponentRegistry::builder()
            .with(Arc::new(kernel.clone()))
            .with(Arc::new(PairingBoot::new(Arc::clone(&slot), config)))
            .with(Arc::new(router.clone()))
            .with(Arc::new(PairingService::new(handle, router.clone())))
            .with(Arc::new(Clock::new(kernel, broadcaster)));
        for component in components {
            builder.register(component);
        }
        let registry = builder.build();

        if let Err(e) = registry.start_all().await {
            registry.deliver_pending(&mut broadcasts).await;
            registry.stop_all().await;
            return Err(e);
        }
        let dispatch = registry.spawn_dispatch(broadcasts);

        let taken = slot.lock().await.take();
        let Some(machine) = taken else {
            registry.stop_all().await;
            dispatch.abort();
            return Err(Error::Shutdown("pairing machine is gone".to_string()));
        };

        registry.booted().await;
        tracing::info!(identity = ?router.identity(), components = ?registry.names(), "satellite running");

        let mut pairing = tokio::spawn(machine.run(router));
        let finished = tokio::select! {
            joined = &mut pairing => Some(flatten(joined)),
            () = shutdown => {
                tracing::info!("shutdown requested");
                None
            }
        };

        registry.stop_all().await;

        let outcome = match finished {
            Some(outcome) => outcome,
            None => match tokio::time::timeout(PAIRING_JOIN_BOUND, &mut pairing).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    tracing::warn!("pairing machine did not stop in time, aborting");
                    pairing.abort();
                    Ok(())
                }
            },
        };

        dispatch.abort();
        outcome
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| Error::Shutdown(format!("pairing task failed: {e}")))?
}

impl std::fmt::Debug for Satellite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Satellite")
            .field("kernel", &self.kernel)
            .field("machine", &self.machine)
            .field("components", &self.components.len())
            .finish_non_exhaustive()
    }
}
