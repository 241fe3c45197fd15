//! Concurrency kernel
//!
//! Registries of named one-shot timers, named background tasks and named
//! cooperative flags. Every operation is best-effort: unknown names are
//! no-ops and nothing here returns an error.

mod event;
mod thread;
mod timer;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;
use crate::registry::{Component, SatelliteEvent, Stage};

pub use event::{EventFlag, Hook};
pub use thread::{TaskFuture, ThreadHandle};
pub use timer::{Callback, TimerHandle};

use thread::ThreadEntry;
use timer::{TimerEntry, TimerState};

/// Bound on joining the previous holder of a task name
const REPLACE_JOIN_BOUND: Duration = Duration::from_secs(2);

/// Bound on joining a terminated task
const TERMINATE_JOIN_BOUND: Duration = Duration::from_secs(1);

/// Shared handle to the kernel registries
#[derive(Clone, Default)]
pub struct Kernel {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    timers: Mutex<HashMap<String, TimerEntry>>,
    threads: Mutex<HashMap<String, ThreadEntry>>,
    events: Mutex<HashMap<String, EventFlag>>,
    next_timer_id: AtomicU64,
}

impl Kernel {
    /// Create an empty kernel
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, TimerEntry>> {
        self.inner.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn threads(&self) -> std::sync::MutexGuard<'_, HashMap<String, ThreadEntry>> {
        self.inner.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn events(&self) -> std::sync::MutexGuard<'_, HashMap<String, EventFlag>> {
        self.inner.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Timers

    /// Schedule `callback` to run once after `interval`
    ///
    /// A timer already registered under `name` is cancelled first. With
    /// `auto_start = false` the timer waits for [`Kernel::start_timer`].
    pub fn new_timer(
        &self,
        name: &str,
        interval: Duration,
        callback: impl FnOnce() + Send + 'static,
        auto_start: bool,
    ) -> TimerHandle {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Box::new(callback);

        let state = if auto_start {
            TimerState::Armed(arm(interval, callback))
        } else {
            TimerState::Idle { interval, callback }
        };

        let previous = self
            .timers()
            .insert(name.to_string(), TimerEntry { id, state });
        if let Some(previous) = previous {
            tracing::trace!(timer = name, "replaced timer");
            previous.cancel();
        }

        TimerHandle {
            name: name.to_string(),
            id,
        }
    }

    /// Arm a timer created with `auto_start = false`
    ///
    /// Returns whether the timer was armed by this call.
    pub fn start_timer(&self, handle: &TimerHandle) -> bool {
        let mut timers = self.timers();
        let Some(entry) = timers.remove(&handle.name) else {
            return false;
        };
        if entry.id != handle.id {
            timers.insert(handle.name.clone(), entry);
            return false;
        }

        let (state, started) = match entry.state {
            TimerState::Idle { interval, callback } => {
                (TimerState::Armed(arm(interval, callback)), true)
            }
            armed @ TimerState::Armed(_) => (armed, false),
        };
        timers.insert(
            handle.name.clone(),
            TimerEntry {
                id: entry.id,
                state,
            },
        );
        started
    }

    /// Cancel the timer behind `handle`
    ///
    /// Cancelling a fired, cancelled or replaced timer is a no-op.
    pub fn cancel_timer(&self, handle: &TimerHandle) {
        let mut timers = self.timers();
        if timers.get(&handle.name).is_some_and(|e| e.id == handle.id)
            && let Some(entry) = timers.remove(&handle.name)
        {
            tracing::trace!(timer = %handle.name, "cancelled timer");
            entry.cancel();
        }
    }

    /// Cancel whatever timer is registered under `name`
    pub fn cancel_named_timer(&self, name: &str) {
        if let Some(entry) = self.timers().remove(name) {
            entry.cancel();
        }
    }

    /// Whether a timer is registered under `name` and has not fired yet
    #[must_use]
    pub fn has_pending_timer(&self, name: &str) -> bool {
        self.timers().get(name).is_some_and(|e| !e.is_finished())
    }

    // Threads

    /// Register a named background task
    ///
    /// A task already running under `name` is joined first, and aborted if it
    /// does not stop within two seconds, so at most one task per name is live.
    pub async fn new_thread<F>(&self, name: &str, task: F, autostart: bool) -> ThreadHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let previous = self.threads().remove(name);
        if let Some(previous) = previous {
            tracing::debug!(thread = name, "joining previous task before replacing it");
            previous.join_bounded(name, REPLACE_JOIN_BOUND).await;
        }

        let task: TaskFuture = Box::pin(task);
        let entry = if autostart {
            ThreadEntry::Running(tokio::spawn(task))
        } else {
            ThreadEntry::Pending(task)
        };

        let displaced = self.threads().insert(name.to_string(), entry);
        if let Some(displaced) = displaced {
            tracing::warn!(thread = name, "task registered concurrently, aborting the other one");
            displaced.abort();
        }

        tracing::debug!(thread = name, autostart, "registered task");
        ThreadHandle {
            name: name.to_string(),
            started: autostart,
        }
    }

    /// Start a task created with `autostart = false`
    ///
    /// Returns whether the task was started by this call.
    pub fn start_thread(&self, name: &str) -> bool {
        let mut threads = self.threads();
        match threads.remove(name) {
            Some(ThreadEntry::Pending(task)) => {
                threads.insert(name.to_string(), ThreadEntry::Running(tokio::spawn(task)));
                true
            }
            Some(running) => {
                threads.insert(name.to_string(), running);
                false
            }
            None => false,
        }
    }

    /// Join the task registered under `name`
    ///
    /// Waits at most one second, then aborts the task and logs. Never fails.
    pub async fn terminate_thread(&self, name: &str) {
        let entry = self.threads().remove(name);
        if let Some(entry) = entry {
            entry.join_bounded(name, TERMINATE_JOIN_BOUND).await;
            tracing::debug!(thread = name, "task terminated");
        }
    }

    /// Whether the task registered under `name` is running
    #[must_use]
    pub fn is_thread_alive(&self, name: &str) -> bool {
        self.threads().get(name).is_some_and(ThreadEntry::is_alive)
    }

    // Events

    /// Register a named flag, clearing any flag previously registered under `name`
    pub fn new_event(
        &self,
        name: &str,
        on_set: Option<Hook>,
        on_clear: Option<Hook>,
    ) -> EventFlag {
        let flag = EventFlag::new(name, on_set, on_clear);
        let previous = self.events().insert(name.to_string(), flag.clone());
        if let Some(previous) = previous {
            previous.clear();
        }
        flag
    }

    /// The flag registered under `name`, or a fresh unregistered unset flag
    #[must_use]
    pub fn get_event(&self, name: &str) -> EventFlag {
        self.events()
            .get(name)
            .cloned()
            .unwrap_or_else(|| EventFlag::new(name, None, None))
    }

    /// Clear and unregister the flag registered under `name`
    pub fn clear_event(&self, name: &str) {
        let flag = self.events().remove(name);
        if let Some(flag) = flag {
            flag.clear();
        }
    }

    // Housekeeping

    /// Drop bookkeeping for fired timers and finished tasks
    pub fn sweep(&self) {
        let timers = {
            let mut timers = self.timers();
            let before = timers.len();
            timers.retain(|_, entry| !entry.is_finished());
            before - timers.len()
        };
        let threads = {
            let mut threads = self.threads();
            let before = threads.len();
            threads.retain(|_, entry| !entry.is_finished());
            before - threads.len()
        };

        if timers + threads > 0 {
            tracing::debug!(timers, threads, "swept finished kernel entries");
        }
    }

    /// Cancel every timer, clear every flag and terminate every task
    pub async fn shutdown(&self) {
        let timers: Vec<_> = self.timers().drain().map(|(_, entry)| entry).collect();
        for entry in timers {
            entry.cancel();
        }

        let events: Vec<_> = self.events().drain().map(|(_, flag)| flag).collect();
        for flag in events {
            flag.clear();
        }

        let threads: Vec<_> = self.threads().drain().collect();
        let count = threads.len();
        for (name, entry) in threads {
            entry.join_bounded(&name, TERMINATE_JOIN_BOUND).await;
        }

        tracing::debug!(threads = count, "kernel shut down");
    }
}

fn arm(interval: Duration, callback: Callback) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        callback();
    })
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("timers", &self.timers().len())
            .field("threads", &self.threads().len())
            .field("events", &self.events().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Component for Kernel {
    fn name(&self) -> &str {
        "kernel"
    }

    fn stage(&self) -> Stage {
        Stage::Process
    }

    async fn on_stop(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }

    async fn on_event(&self, event: &SatelliteEvent) -> Result<()> {
        if matches!(event, SatelliteEvent::QuarterHour) {
            self.sweep();
        }
        Ok(())
    }
}
