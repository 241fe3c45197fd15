//! Named background tasks

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

/// Body of a named background task
pub type TaskFuture = BoxFuture<'static, ()>;

/// Handle to a named background task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadHandle {
    pub(super) name: String,
    pub(super) started: bool,
}

impl ThreadHandle {
    /// Task name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task was started when the handle was issued
    #[must_use]
    pub const fn started(&self) -> bool {
        self.started
    }
}

pub(super) enum ThreadEntry {
    /// Created with `autostart = false`
    Pending(TaskFuture),
    Running(JoinHandle<()>),
}

impl ThreadEntry {
    pub(super) fn is_finished(&self) -> bool {
        matches!(self, Self::Running(handle) if handle.is_finished())
    }

    pub(super) fn is_alive(&self) -> bool {
        matches!(self, Self::Running(handle) if !handle.is_finished())
    }

    pub(super) fn abort(self) {
        if let Self::Running(handle) = self {
            handle.abort();
        }
    }

    /// Join the task, aborting it if it does not finish within `bound`
    pub(super) async fn join_bounded(self, name: &str, bound: Duration) {
        let mut handle = match self {
            Self::Pending(_) => {
                tracing::debug!(thread = name, "dropped task that was never started");
                return;
            }
            Self::Running(handle) => handle,
        };

        match tokio::time::timeout(bound, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => {
                tracing::error!(thread = name, error = %e, "task ended abnormally");
            }
            Err(_) => {
                tracing::warn!(
                    thread = name,
                    bound_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX),
                    "task did not stop in time, aborting"
                );
                handle.abort();
            }
        }
    }
}
