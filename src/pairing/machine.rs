//! Pairing state machine
//!
//! The machine runs as a single actor task: it is the only writer of the
//! pairing state and the greeting retry counter. Router callbacks, kernel
//! timers and the heartbeat loop talk to it through [`Trigger`]s.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::discovery::{self, DiscoverySettings};
use super::heartbeat::{HeartbeatLoop, HeartbeatMonitor};
use super::{DeviceIdentity, PairingState};
use crate::config::SharedConfig;
use crate::kernel::{Kernel, TimerHandle};
use crate::registry::{Broadcaster, SatelliteEvent};
use crate::router::{MessageRouter, Payload, topics};
use crate::{Error, Result};

/// Kernel names used by the machine
const GREETING_TIMER: &str = "greeting_retry";
const DORMANT_TIMER: &str = "dormant_retry";
const HEARTBEAT: &str = "heartbeat";

/// Broadcast origin of pairing events
const ORIGIN: &str = "pairing";

/// Something that may move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The hub accepted the greeting
    ConnectionAccepted,
    /// The hub refused the greeting
    ConnectionRefused,
    /// The greeting retry timer of the given cycle fired
    RetryElapsed(u64),
    /// The dormant timer of the given cycle fired
    DormantElapsed(u64),
    /// The heartbeat loop saw no hub heartbeat for too long
    HeartbeatTimeout,
    /// The hub announced it is going away
    HubDisconnected,
    /// The hub announced it is back
    HubReconnected,
    /// Stop the machine
    Shutdown,
}

/// Timing of the greeting and heartbeat cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingTiming {
    pub greeting_retry: Duration,
    pub greeting_attempts: u32,
    pub dormant: Duration,
    pub heartbeat_step: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for PairingTiming {
    fn default() -> Self {
        Self {
            greeting_retry: Duration::from_secs(5),
            greeting_attempts: 5,
            dormant: Duration::from_secs(300),
            heartbeat_step: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}

/// Cloneable handle to a running state machine
#[derive(Debug, Clone)]
pub struct PairingHandle {
    triggers: mpsc::UnboundedSender<Trigger>,
    state: watch::Receiver<PairingState>,
}

impl PairingHandle {
    /// Deliver a trigger to the machine
    pub fn trigger(&self, trigger: Trigger) {
        if self.triggers.send(trigger).is_err() {
            tracing::debug!(?trigger, "pairing machine is gone, trigger dropped");
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PairingState {
        *self.state.borrow()
    }

    /// Receiver notified on every transition
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.state.clone()
    }

    /// Wait until the machine reaches `state`
    ///
    /// Returns false if the machine went away first.
    pub async fn wait_for(&self, state: PairingState) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state).await.is_ok()
    }
}

/// The pairing state machine
pub struct PairingStateMachine {
    kernel: Kernel,
    broadcaster: Broadcaster,
    monitor: HeartbeatMonitor,
    timing: PairingTiming,
    state: watch::Sender<PairingState>,
    handle: PairingHandle,
    triggers: mpsc::UnboundedReceiver<Trigger>,
    identity: Option<DeviceIdentity>,
    retries: u32,
    cycle: u64,
    timer: Option<TimerHandle>,
}

impl PairingStateMachine {
    /// Create a machine in `Booting`
    #[must_use]
    pub fn new(kernel: Kernel, broadcaster: Broadcaster, monitor: HeartbeatMonitor) -> Self {
        let (state, state_rx) = watch::channel(PairingState::Booting);
        let (triggers_tx, triggers) = mpsc::unbounded_channel();

        Self {
            kernel,
            broadcaster,
            monitor,
            timing: PairingTiming::default(),
            state,
            handle: PairingHandle {
                triggers: triggers_tx,
                state: state_rx,
            },
            triggers,
            identity: None,
            retries: 0,
            cycle: 0,
            timer: None,
        }
    }

    /// Override the greeting and heartbeat timing
    #[must_use]
    pub const fn with_timing(mut self, timing: PairingTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Handle for triggering and observing the machine
    #[must_use]
    pub fn handle(&self) -> PairingHandle {
        self.handle.clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PairingState {
        *self.state.borrow()
    }

    /// Resolve the device identity
    ///
    /// Resumes with the persisted identity when there is one. Otherwise runs
    /// discovery and persists the hub address and attributed uid.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if discovery fails or its result cannot be saved
    pub async fn boot(&mut self, config: &SharedConfig) -> Result<DeviceIdentity> {
        let snapshot = config.read().unwrap_or_else(|e| e.into_inner()).clone();

        if let Some(identity) = snapshot.identity() {
            tracing::info!(identity = %identity, "resuming with persisted identity");
            self.identity = Some(identity.clone());
            return Ok(identity);
        }

        self.transition(PairingState::New);
        let announcement = match discovery::discover(DiscoverySettings::from_config(&snapshot)).await {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::error!(error = %e, "hub discovery failed");
                self.transition(PairingState::Error);
                return Err(e.into());
            }
        };

        let saved = config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .persist_pairing(&announcement.hub_ip.to_string(), &announcement.uid);
        if let Err(e) = saved {
            tracing::error!(error = %e, "failed to save pairing");
            self.transition(PairingState::Error);
            return Err(Error::Config(format!("cannot persist pairing: {e}")));
        }

        let identity = DeviceIdentity::new(announcement.uid, snapshot.device.site_name);
        self.transition(PairingState::Accepted);
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Run the greeting and supervision cycle until shutdown or refusal
    ///
    /// # Errors
    ///
    /// Returns `Refused` when the hub refuses the greeting, or `Config` when
    /// called without a booted identity
    pub async fn run(mut self, router: MessageRouter) -> Result<()> {
        let Some(identity) = self.identity.clone() else {
            return Err(Error::Config("pairing started without an identity".to_string()));
        };

        self.begin_greeting(&router, &identity).await;

        let result = loop {
            let Some(trigger) = self.triggers.recv().await else {
                break Ok(());
            };
            if let ControlFlow::Break(result) = self.on_trigger(trigger, &router, &identity).await {
                break result;
            }
        };

        self.cancel_timer();
        self.stop_heartbeat().await;
        tracing::debug!(state = %self.state(), "pairing machine stopped");
        result
    }

    async fn on_trigger(
        &mut self,
        trigger: Trigger,
        router: &MessageRouter,
        identity: &DeviceIdentity,
    ) -> ControlFlow<Result<()>> {
        use PairingState::{Disconnected, Dormant, Registered, WaitingReply};

        let state = self.state();
        match (trigger, state) {
            (Trigger::Shutdown, _) => return ControlFlow::Break(Ok(())),

            (Trigger::ConnectionAccepted, WaitingReply) => {
                self.cancel_timer();
                self.retries = 0;
                self.transition(Registered);
                self.start_heartbeat(router, identity).await;
            }

            (Trigger::ConnectionRefused, WaitingReply) => {
                self.cancel_timer();
                self.transition(PairingState::Refused);
                tracing::error!("the hub refused this satellite");
                return ControlFlow::Break(Err(Error::Refused));
            }

            (Trigger::RetryElapsed(cycle), WaitingReply) if cycle == self.cycle => {
                self.greet(router, identity).await;
            }

            (Trigger::DormantElapsed(cycle), Dormant) if cycle == self.cycle => {
                tracing::info!("dormant period over, greeting the hub again");
                self.begin_greeting(router, identity).await;
            }

            (Trigger::HeartbeatTimeout, Registered) => {
                self.stop_heartbeat().await;
                self.transition(Disconnected);
            }

            (Trigger::HubDisconnected, Registered | WaitingReply | Dormant) => {
                tracing::info!("hub announced its disconnection");
                self.cancel_timer();
                self.stop_heartbeat().await;
                self.transition(Disconnected);
            }

            (Trigger::HubReconnected, Registered) => {
                tracing::info!("hub restarted, registering again");
                self.stop_heartbeat().await;
                self.transition(Disconnected);
                self.begin_greeting(router, identity).await;
            }

            (Trigger::HubReconnected, Disconnected | Dormant) => {
                tracing::info!("hub is back, greeting it");
                self.cancel_timer();
                self.begin_greeting(router, identity).await;
            }

            (trigger, state) => {
                tracing::debug!(?trigger, %state, "trigger ignored in this state");
            }
        }

        ControlFlow::Continue(())
    }

    /// Enter `WaitingReply` with a fresh retry budget and send the first greeting
    async fn begin_greeting(&mut self, router: &MessageRouter, identity: &DeviceIdentity) {
        self.retries = 0;
        self.transition(PairingState::WaitingReply);
        self.greet(router, identity).await;
    }

    /// Send one greeting, or go dormant once the attempts are exhausted
    async fn greet(&mut self, router: &MessageRouter, identity: &DeviceIdentity) {
        let bound = self.timing.greeting_attempts;

        if self.retries >= bound {
            tracing::warn!(
                attempts = bound,
                retry_in_secs = self.timing.dormant.as_secs(),
                "hub did not answer the greetings, going dormant"
            );
            self.retries = 0;
            self.transition(PairingState::Dormant);
            self.schedule(DORMANT_TIMER, self.timing.dormant, Trigger::DormantElapsed);
            return;
        }

        self.retries += 1;
        tracing::info!(attempt = self.retries, of = bound, "sending greeting to the hub");
        router
            .publish(topics::GREETING, Payload::Json(identity.announcement()))
            .await;
        self.schedule(GREETING_TIMER, self.timing.greeting_retry, Trigger::RetryElapsed);
    }

    /// Replace the pending timer with one sending `trigger` for a new cycle
    fn schedule(&mut self, name: &str, interval: Duration, trigger: fn(u64) -> Trigger) {
        self.cancel_timer();
        self.cycle += 1;

        let cycle = self.cycle;
        let handle = self.handle.clone();
        self.timer = Some(self.kernel.new_timer(
            name,
            interval,
            move || handle.trigger(trigger(cycle)),
            true,
        ));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.kernel.cancel_timer(&timer);
        }
    }

    async fn start_heartbeat(&self, router: &MessageRouter, identity: &DeviceIdentity) {
        let flag = self.kernel.new_event(HEARTBEAT, None, None);
        flag.set();

        let heartbeat = HeartbeatLoop {
            flag,
            router: router.clone(),
            identity: identity.clone(),
            monitor: self.monitor.clone(),
            pairing: self.handle.clone(),
            step: self.timing.heartbeat_step,
            timeout: self.timing.heartbeat_timeout,
        };
        self.kernel.new_thread(HEARTBEAT, heartbeat.run(), true).await;
    }

    async fn stop_heartbeat(&self) {
        self.kernel.clear_event(HEARTBEAT);
        self.kernel.terminate_thread(HEARTBEAT).await;
    }

    fn transition(&self, to: PairingState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(%from, %to, "pairing state changed");
            self.broadcaster
                .broadcast(SatelliteEvent::StateChanged { from, to }, ORIGIN);
        }
    }
}

impl std::fmt::Debug for PairingStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingStateMachine")
            .field("state", &self.state())
            .field("identity", &self.identity)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}
