//! Lifecycle glue between the registry and the pairing state machine

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::machine::{PairingHandle, PairingStateMachine, Trigger};
use crate::config::SharedConfig;
use crate::registry::{Component, Stage};
use crate::router::{MessageRouter, Payload, topics};
use crate::{Error, Result};

/// The state machine, parked until it has booted and is handed to its task
pub type MachineSlot = Arc<Mutex<Option<PairingStateMachine>>>;

/// Discovery-stage component resolving the device identity
///
/// Resumes the persisted identity or pairs with a hub before the router
/// connects. A failed discovery aborts startup.
pub struct PairingBoot {
    machine: MachineSlot,
    config: SharedConfig,
}

impl PairingBoot {
    #[must_use]
    pub const fn new(machine: MachineSlot, config: SharedConfig) -> Self {
        Self { machine, config }
    }
}

impl std::fmt::Debug for PairingBoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingBoot").finish_non_exhaustive()
    }
}

#[async_trait]
impl Component for PairingBoot {
    fn name(&self) -> &str {
        "discovery"
    }

    fn stage(&self) -> Stage {
        Stage::Discovery
    }

    async fn on_start(&self) -> Result<()> {
        let mut slot = self.machine.lock().await;
        let Some(machine) = slot.as_mut() else {
            return Err(Error::Config("pairing machine is already running".to_string()));
        };

        let identity = machine.boot(&self.config).await?;
        tracing::debug!(identity = %identity, "identity resolved");
        Ok(())
    }
}

/// Pool component that announces a voluntary disconnection on shutdown
#[derive(Debug, Clone)]
pub struct PairingService {
    handle: PairingHandle,
    router: MessageRouter,
}

impl PairingService {
    #[must_use]
    pub const fn new(handle: PairingHandle, router: MessageRouter) -> Self {
        Self { handle, router }
    }
}

#[async_trait]
impl Component for PairingService {
    fn name(&self) -> &str {
        "pairing"
    }

    async fn on_stop(&self) -> Result<()> {
        // Nothing to announce when pairing never produced an identity
        if let Some(identity) = self.router.identity() {
            tracing::info!(uid = %identity.uid, "announcing disconnection to the hub");
            self.router
                .publish(topics::DISCONNECTING, Payload::Json(identity.announcement()))
                .await;
        }
        self.handle.trigger(Trigger::Shutdown);
        Ok(())
    }
}
