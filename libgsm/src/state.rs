use std::fmt;

use tokio::sync::watch;
use tracing::info;

use crate::error::{LifecycleError, Result};

/// Process-wide lifecycle of the managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Initializing,
    Updating,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Updating => "updating",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Stopped => "stopped",
        }
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Initializing, Updating)
                | (Updating, Starting)
                | (Updating, Stopped)
                | (Starting, Running)
                | (Initializing | Updating | Starting | Running, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == LifecycleState::Stopped
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the single [`LifecycleState`] value.
///
/// Writes go through [`StateMachine::transition`], which validates the edge and logs it.
/// Readers subscribe and observe every change without holding a lock.
pub struct StateMachine {
    tx: watch::Sender<LifecycleState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Initializing);
        Self { tx }
    }

    pub fn current(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn transition(&self, to: LifecycleState) -> Result<()> {
        let mut outcome = Ok(());
        // send_if_modified keeps check-and-set atomic with respect to other writers.
        self.tx.send_if_modified(|state| {
            let from = *state;
            if !from.can_transition_to(to) {
                outcome = Err(LifecycleError::InvalidTransition { from, to });
                return false;
            }
            *state = to;
            info!(from = %from, to = %to, "lifecycle transition");
            true
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let sm = StateMachine::new();
        for to in [
            LifecycleState::Updating,
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::ShuttingDown,
            LifecycleState::Stopped,
        ] {
            sm.transition(to).unwrap();
            assert_eq!(sm.current(), to);
        }
        assert!(sm.current().is_terminal());
    }

    #[test]
    fn test_rejects_skipping_states() {
        let sm = StateMachine::new();
        let err = sm.transition(LifecycleState::Running).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: LifecycleState::Initializing,
                to: LifecycleState::Running
            }
        ));
        assert_eq!(sm.current(), LifecycleState::Initializing);
    }

    #[test]
    fn test_shutdown_reachable_before_running() {
        let sm = StateMachine::new();
        sm.transition(LifecycleState::Updating).unwrap();
        sm.transition(LifecycleState::ShuttingDown).unwrap();
        sm.transition(LifecycleState::Stopped).unwrap();
        assert!(sm.transition(LifecycleState::Updating).is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let sm = StateMachine::new();
        let mut rx = sm.subscribe();
        sm.transition(LifecycleState::Updating).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LifecycleState::Updating);
    }
}
