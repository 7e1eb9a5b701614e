//! Process lifecycle context.
//!
//! A [`Lifecycle`] is shared by the poll loop, the command handler and the
//! signal handler. It replaces global running flags: tasks observe the
//! current state at their checkpoints and await [`Lifecycle::cancelled`]
//! while idle.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Bridge lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Disconnected,
    /// Bus connected, online marker published.
    Connected,
    /// Discovery published, polling active.
    Running,
    /// Termination requested; finishing in-flight work.
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Draining or stopped.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::Draining | Self::Stopped)
    }

    fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Disconnected, Connected)
                | (Connected, Running)
                | (Disconnected | Connected | Running, Draining)
                | (Draining, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared lifecycle handle. Cloning is cheap.
#[derive(Debug, Clone)]
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
        let (tx, _rx) = watch::channel(LifecycleState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Move to `next`, rejecting out-of-order transitions.
    pub fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!(
                    category = "lifecycle",
                    from = %current,
                    to = %next,
                    "Lifecycle transition"
                );
                *current = next;
                true
            } else {
                outcome = Err(Error::Lifecycle {
                    from: current.to_string(),
                    to: next.to_string(),
                });
                false
            }
        });
        outcome
    }

    /// Request shutdown. Idempotent; returns `true` if this call started draining.
    pub fn begin_drain(&self) -> bool {
        self.transition(LifecycleState::Draining).is_ok()
    }

    /// Whether shutdown has been requested.
    pub fn is_draining(&self) -> bool {
        self.state().is_shutting_down()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot fail here.
        let _ = rx.wait_for(|state| state.is_shutting_down()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_forward_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Disconnected);
        lifecycle.transition(LifecycleState::Connected).unwrap();
        lifecycle.transition(LifecycleState::Running).unwrap();
        assert!(!lifecycle.is_draining());
        assert!(lifecycle.begin_drain());
        assert!(lifecycle.is_draining());
        lifecycle.transition(LifecycleState::Stopped).unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_rejects_backward_transition() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition(LifecycleState::Connected).unwrap();
        let err = lifecycle
            .transition(LifecycleState::Disconnected)
            .unwrap_err();
        assert!(err.to_string().contains("connected -> disconnected"));
        assert_eq!(lifecycle.state(), LifecycleState::Connected);
    }

    #[test]
    fn test_begin_drain_is_idempotent() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_drain());
        assert!(!lifecycle.begin_drain());
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let lifecycle = Lifecycle::new();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        lifecycle.begin_drain();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
