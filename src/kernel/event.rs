//! Named cooperative boolean flags
//!
//! A flag is a `watch` channel holding a bool. Loops gate themselves on it and
//! the optional hooks fire only on an actual edge (unset -> set, set -> unset).

use std::sync::Arc;

use tokio::sync::watch;

/// Callback fired on a flag edge
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// A named, cloneable boolean flag with edge-triggered hooks
#[derive(Clone)]
pub struct EventFlag {
    inner: Arc<FlagInner>,
}

struct FlagInner {
    name: String,
    state: watch::Sender<bool>,
    on_set: Option<Hook>,
    on_clear: Option<Hook>,
}

impl EventFlag {
    /// Create an unset flag
    #[must_use]
    pub fn new(name: impl Into<String>, on_set: Option<Hook>, on_clear: Option<Hook>) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            inner: Arc::new(FlagInner {
                name: name.into(),
                state,
                on_set,
                on_clear,
            }),
        }
    }

    /// Flag name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the flag is currently set
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.inner.state.borrow()
    }

    /// Set the flag, firing `on_set` if it was unset
    pub fn set(&self) {
        let was_set = self.inner.state.send_replace(true);
        if !was_set {
            tracing::trace!(flag = %self.inner.name, "flag set");
            if let Some(hook) = &self.inner.on_set {
                hook();
            }
        }
    }

    /// Clear the flag, firing `on_clear` if it was set
    pub fn clear(&self) {
        let was_set = self.inner.state.send_replace(false);
        if was_set {
            tracing::trace!(flag = %self.inner.name, "flag cleared");
            if let Some(hook) = &self.inner.on_clear {
                hook();
            }
        }
    }

    /// Wait until the flag is set
    pub async fn wait_set(&self) {
        self.wait_for(true).await;
    }

    /// Wait until the flag is cleared
    pub async fn wait_cleared(&self) {
        self.wait_for(false).await;
    }

    async fn wait_for(&self, wanted: bool) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|value| *value == wanted).await;
    }
}

impl std::fmt::Debug for EventFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFlag")
            .field("name", &self.inner.name)
            .field("set", &self.is_set())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn counter_hook(counter: &Arc<AtomicUsize>) -> Hook {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn hooks_fire_on_edges_only() {
        let sets = Arc::new(AtomicUsize::new(0));
        let clears = Arc::new(AtomicUsize::new(0));
        let flag = EventFlag::new("test", Some(counter_hook(&sets)), Some(counter_hook(&clears)));

        flag.clear();
        assert_eq!(clears.load(Ordering::SeqCst), 0);

        flag.set();
        flag.set();
        assert!(flag.is_set());
        assert_eq!(sets.load(Ordering::SeqCst), 1);

        flag.clear();
        flag.clear();
        assert!(!flag.is_set());
        assert_eq!(clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_state() {
        let flag = EventFlag::new("shared", None, None);
        let other = flag.clone();
        other.set();
        assert!(flag.is_set());
        assert_eq!(flag.name(), "shared");
    }

    #[tokio::test]
    async fn wait_cleared_wakes_on_clear() {
        let flag = EventFlag::new("gate", None, None);
        flag.set();

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait_cleared().await })
        };

        tokio::task::yield_now().await;
        flag.clear();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn wait_set_pends_until_set() {
        let flag = EventFlag::new("ready", None, None);
        let mut wait = tokio_test::task::spawn(flag.wait_set());
        tokio_test::assert_pending!(wait.poll());

        flag.set();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test]
    async fn wait_set_returns_immediately_when_set() {
        let flag = EventFlag::new("ready", None, None);
        flag.set();
        tokio::time::timeout(Duration::from_millis(100), flag.wait_set())
            .await
            .expect("already set");
    }
}
