//! Wall-clock ticks
//!
//! Broadcasts `FullMinute` at the top of every minute, plus `FiveMinute`,
//! `QuarterHour` and `FullHour` on the matching minutes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike};

use crate::Result;
use crate::kernel::{EventFlag, Kernel};
use crate::registry::{Broadcaster, Component, SatelliteEvent};

const NAME: &str = "clock";

/// Pool component emitting wall-clock ticks
#[derive(Debug, Clone)]
pub struct Clock {
    kernel: Kernel,
    broadcaster: Broadcaster,
}

impl Clock {
    #[must_use]
    pub const fn new(kernel: Kernel, broadcaster: Broadcaster) -> Self {
        Self {
            kernel,
            broadcaster,
        }
    }
}

/// Events due at `minute` past the hour
#[must_use]
pub fn ticks_for_minute(minute: u32) -> Vec<SatelliteEvent> {
    let mut ticks = vec![SatelliteEvent::FullMinute];
    if minute % 5 == 0 {
        ticks.push(SatelliteEvent::FiveMinute);
    }
    if minute % 15 == 0 {
        ticks.push(SatelliteEvent::QuarterHour);
    }
    if minute == 0 {
        ticks.push(SatelliteEvent::FullHour);
    }
    ticks
}

/// Time left until the next full minute after `now`
#[must_use]
pub fn until_next_minute(now: DateTime<Local>) -> Duration {
    // Leap seconds push nanosecond() past one billion
    let into_minute = Duration::new(u64::from(now.second()), now.nanosecond() % 1_000_000_000);
    Duration::from_secs(60).saturating_sub(into_minute)
}

async fn tick(flag: EventFlag, broadcaster: Broadcaster) {
    while flag.is_set() {
        let wait = until_next_minute(Local::now());
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = flag.wait_cleared() => break,
        }

        // Landing a hair early would repeat the previous minute
        let now = Local::now() + chrono::Duration::milliseconds(500);
        for event in ticks_for_minute(now.minute()) {
            broadcaster.broadcast(event, NAME);
        }
    }
}

#[async_trait]
impl Component for Clock {
    fn name(&self) -> &str {
        NAME
    }

    async fn on_start(&self) -> Result<()> {
        let flag = self.kernel.new_event(NAME, None, None);
        flag.set();
        self.kernel
            .new_thread(NAME, tick(flag, self.broadcaster.clone()), true)
            .await;
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        self.kernel.clear_event(NAME);
        self.kernel.terminate_thread(NAME).await;
        Ok(())
    }
}
