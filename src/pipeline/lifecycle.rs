//! Pipeline lifecycle shared by all stages.
//!
//! `Created -> Running -> Stopping -> Stopped`. Transitions only move forward.
//! Threads poll [`Lifecycle::should_stop`] at every loop boundary and after
//! every bounded wait; async tasks await [`Lifecycle::stopping`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Cloneable handle on the pipeline state
#[derive(Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecycleState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Created);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// True once a stop was requested.
    pub fn should_stop(&self) -> bool {
        self.state() >= LifecycleState::Stopping
    }

    /// Ask every stage to wind down. Returns false if already stopping.
    pub fn request_stop(&self) -> bool {
        self.advance(LifecycleState::Stopping)
    }

    /// Move forward to `to`; backwards or repeated transitions are ignored.
    pub(crate) fn advance(&self, to: LifecycleState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if to > *state {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(state = %to, "pipeline lifecycle");
        }
        moved
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Resolves once a stop was requested.
    pub async fn stopping(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|state| *state >= LifecycleState::Stopping).await;
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lifecycle").field(&self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn moves_forward_only() {
        let lc = Lifecycle::new();
        assert_eq!(lc.state(), LifecycleState::Created);
        assert!(lc.advance(LifecycleState::Running));
        assert!(lc.is_running());
        assert!(lc.request_stop());
        assert!(!lc.request_stop());
        assert!(!lc.advance(LifecycleState::Running));
        assert_eq!(lc.state(), LifecycleState::Stopping);
        assert!(lc.advance(LifecycleState::Stopped));
        assert!(!lc.advance(LifecycleState::Created));
        assert_eq!(lc.state(), LifecycleState::Stopped);
    }

    #[test]
    fn clones_share_state() {
        let lc = Lifecycle::new();
        let other = lc.clone();
        other.request_stop();
        assert!(lc.should_stop());
    }

    #[tokio::test]
    async fn stopping_resolves_after_request() {
        let lc = Lifecycle::new();
        lc.advance(LifecycleState::Running);

        let waiter = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.stopping().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        lc.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stopping() resolved")
            .unwrap();
    }

    #[tokio::test]
    async fn stopping_resolves_immediately_when_already_stopped() {
        let lc = Lifecycle::new();
        lc.advance(LifecycleState::Stopped);
        tokio::time::timeout(Duration::from_millis(100), lc.stopping())
            .await
            .expect("already stopped");
    }
}
