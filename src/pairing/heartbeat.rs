//! Hub liveness supervision
//!
//! The router owns the [`HeartbeatClock`] and stamps it on every hub heartbeat.
//! The heartbeat loop owns the matching [`HeartbeatMonitor`] and reports a
//! timeout to the state machine, which alone decides what it means.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::DeviceIdentity;
use super::machine::{PairingHandle, Trigger};
use crate::kernel::EventFlag;
use crate::router::{MessageRouter, Payload, topics};

/// Writer side: last time the hub proved it is alive
#[derive(Debug)]
pub struct HeartbeatClock {
    tx: watch::Sender<Option<Instant>>,
}

/// Reader side of the [`HeartbeatClock`]
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    rx: watch::Receiver<Option<Instant>>,
}

/// Create a linked clock and monitor
#[must_use]
pub fn clock() -> (HeartbeatClock, HeartbeatMonitor) {
    let (tx, rx) = watch::channel(None);
    (HeartbeatClock { tx }, HeartbeatMonitor { rx })
}

impl HeartbeatClock {
    /// Record a hub heartbeat received now
    pub fn beat(&self) {
        self.tx.send_replace(Some(Instant::now()));
    }
}

impl HeartbeatMonitor {
    /// Last hub heartbeat, if any arrived
    #[must_use]
    pub fn last_beat(&self) -> Option<Instant> {
        *self.rx.borrow()
    }

    /// Time since the last sign of life, counting from `since` at the earliest
    #[must_use]
    pub fn staleness(&self, since: Instant) -> Duration {
        let reference = self.last_beat().map_or(since, |last| last.max(since));
        reference.elapsed()
    }
}

/// The loop run under the `heartbeat` kernel task
pub(crate) struct HeartbeatLoop {
    pub flag: EventFlag,
    pub router: MessageRouter,
    pub identity: DeviceIdentity,
    pub monitor: HeartbeatMonitor,
    pub pairing: PairingHandle,
    pub step: Duration,
    pub timeout: Duration,
}

impl HeartbeatLoop {
    /// Publish, wait, check, wait, until the flag clears or the hub goes quiet
    pub async fn run(self) {
        let started = Instant::now();
        let announcement = self.identity.announcement();
        tracing::debug!(uid = %self.identity.uid, "heartbeat loop started");

        while self.flag.is_set() {
            self.router
                .publish(topics::DEVICE_HEARTBEAT, Payload::Json(announcement.clone()))
                .await;

            if !self.pause().await {
                break;
            }

            let staleness = self.monitor.staleness(started);
            if staleness > self.timeout {
                tracing::warn!(
                    stale_ms = u64::try_from(staleness.as_millis()).unwrap_or(u64::MAX),
                    "hub heartbeat timed out"
                );
                self.pairing.trigger(Trigger::HeartbeatTimeout);
                break;
            }

            if !self.pause().await {
                break;
            }
        }

        tracing::debug!("heartbeat loop stopped");
    }

    /// Sleep one step, returning false if the flag cleared meanwhile
    async fn pause(&self) -> bool {
        tokio::select! {
            () = tokio::time::sleep(self.step) => self.flag.is_set(),
            () = self.flag.wait_cleared() => false,
        }
    }
}
