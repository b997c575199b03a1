//! Listener run state behind an atomic, polled by worker loops between
//! receive attempts.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Starting = 0,
    Started = 1,
    Stopping = 2,
    Stopped = 3,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Starting,
            1 => RunState::Started,
            2 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

/// Shared run-state flag. Transitions wake anyone parked on
/// [`changed`](Self::changed), so loops can react to a stop request without
/// waiting out a full receive timeout.
pub struct RunStateFlag {
    state: AtomicU8,
    changed: Notify,
}

impl RunStateFlag {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Stopped as u8),
            changed: Notify::new(),
        }
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: RunState) {
        self.state.store(state as u8, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn is_started(&self) -> bool {
        self.get() == RunState::Started
    }

    /// Wait until the next state transition.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

impl Default for RunStateFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_transitions() {
        let flag = RunStateFlag::new();
        assert_eq!(flag.get(), RunState::Stopped);
        assert!(!flag.is_started());

        flag.set(RunState::Starting);
        assert_eq!(flag.get(), RunState::Starting);

        flag.set(RunState::Started);
        assert!(flag.is_started());

        flag.set(RunState::Stopping);
        assert!(!flag.is_started());
    }
}
