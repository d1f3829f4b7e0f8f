//! One-way lifecycle gate
//!
//! `Init -> Running -> Stopped`, checked and set under a mutex. Used for the
//! mux state machine and for every idempotent close in the crate.

use std::sync::{Mutex, MutexGuard};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Running,
    Stopped,
}

/// Forward-only state machine guarded by a mutex
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<State>,
}

impl Lifecycle {
    /// Create a gate in the `Init` state
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Init),
        }
    }

    /// Create a gate that is already `Running`
    pub fn running() -> Self {
        Self {
            state: Mutex::new(State::Running),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The guarded value is a plain enum; a poisoned lock still holds a valid state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state
    pub fn state(&self) -> State {
        *self.lock()
    }

    /// `Init -> Running`. Returns false from any other state.
    pub fn start(&self) -> bool {
        let mut state = self.lock();
        if *state != State::Init {
            return false;
        }
        *state = State::Running;
        true
    }

    /// Move to `Stopped`. Returns true only for the call that made the transition.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        if *state == State::Stopped {
            return false;
        }
        *state = State::Stopped;
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == State::Stopped
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_start_only_from_init() {
        let gate = Lifecycle::new();
        assert_eq!(gate.state(), State::Init);
        assert!(gate.start());
        assert_eq!(gate.state(), State::Running);
        assert!(!gate.start());
    }

    #[test]
    fn test_stop_is_one_shot() {
        let gate = Lifecycle::running();
        assert!(gate.stop());
        assert!(!gate.stop());
        assert!(gate.is_stopped());
    }

    #[test]
    fn test_never_restarts_after_stop() {
        let gate = Lifecycle::new();
        assert!(gate.start());
        assert!(gate.stop());
        assert!(!gate.start());
        assert_eq!(gate.state(), State::Stopped);
    }

    #[test]
    fn test_stop_from_init() {
        let gate = Lifecycle::new();
        assert!(gate.stop());
        assert!(!gate.start());
    }

    #[test]
    fn test_concurrent_stop_has_single_winner() {
        let gate = Arc::new(Lifecycle::running());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.stop())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
