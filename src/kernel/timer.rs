//! One-shot named timers

use std::time::Duration;

use tokio::task::JoinHandle;

/// Work executed when a timer fires
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled timer
///
/// The id distinguishes generations of the same name, so cancelling a stale
/// handle never cancels the timer that replaced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub(super) name: String,
    pub(super) id: u64,
}

impl TimerHandle {
    /// Timer name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub(super) struct TimerEntry {
    pub(super) id: u64,
    pub(super) state: TimerState,
}

pub(super) enum TimerState {
    /// Created with `auto_start = false`
    Idle {
        interval: Duration,
        callback: Callback,
    },
    /// Sleeping or firing
    Armed(JoinHandle<()>),
}

impl TimerEntry {
    /// Abort the timer if it is armed
    pub(super) fn cancel(self) {
        if let TimerState::Armed(handle) = self.state {
            handle.abort();
        }
    }

    pub(super) fn is_finished(&self) -> bool {
        matches!(&self.state, TimerState::Armed(handle) if handle.is_finished())
    }
}
