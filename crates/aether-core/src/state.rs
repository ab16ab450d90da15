//! Core lifecycle state machine.
//!
//! The state machine is pure - no I/O, no timers. Methods validate a
//! requested transition and hand back the event for the caller to
//! publish, keeping the machine trivially testable: actions out, effects
//! elsewhere.
//!
//! ```text
//!            ┌────────┐        ┌─────────┐
//!  Idle ────>│Starting│───────>│ Active  │<──────┐
//!            └────────┘        └─────────┘       │
//!                │                  │  │         │
//!                │                  │  └──> Rotating
//!                │                  v
//!                │              Closing ──> Closed ──> Starting
//!                v                  │
//!              Error <──────────────┘   Error ──> Idle | Closed
//! ```
//!
//! The machine is the sole authority on whether new streams may be
//! opened: only `Active` permits it.

use crate::{
    error::CoreError,
    events::EventKind,
};

/// Lifecycle states of a tunnel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreState {
    /// Constructed, nothing dialed yet.
    Idle,
    /// Initial session dial in flight.
    Starting,
    /// Primary session serving streams.
    Active,
    /// Successor session being promoted.
    Rotating,
    /// Graceful shutdown in progress.
    Closing,
    /// Fully shut down; restartable.
    Closed,
    /// Start or rotate failure; requires explicit recovery.
    Error,
}

impl CoreState {
    /// Stable lowercase name used in events and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is one of the enumerated legal transitions.
#[must_use]
pub fn transition_allowed(from: CoreState, to: CoreState) -> bool {
    use CoreState as S;
    matches!(
        (from, to),
        (S::Idle, S::Starting)
            | (S::Starting, S::Active | S::Error)
            | (S::Active, S::Rotating | S::Closing | S::Error)
            | (S::Rotating, S::Active | S::Error)
            | (S::Closing, S::Closed | S::Error)
            | (S::Closed, S::Starting)
            | (S::Error, S::Idle | S::Closed)
    )
}

/// Core lifecycle state machine.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: CoreState,
}

impl StateMachine {
    /// New machine in [`CoreState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self { state: CoreState::Idle }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CoreState {
        self.state
    }

    /// New streams may be opened only while Active.
    #[must_use]
    pub fn may_open_streams(&self) -> bool {
        self.state == CoreState::Active
    }

    /// Attempt a transition, returning the `core.stateChanged` event to
    /// publish.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidTransition` if `state -> to` is not in the
    ///   legal set; the machine is left unchanged
    pub fn transition_to(&mut self, to: CoreState) -> Result<EventKind, CoreError> {
        let from = self.state;
        if !transition_allowed(from, to) {
            return Err(CoreError::InvalidTransition { from, to });
        }
        self.state = to;
        Ok(EventKind::StateChanged { from, to })
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CoreState; 7] = [
        CoreState::Idle,
        CoreState::Starting,
        CoreState::Active,
        CoreState::Rotating,
        CoreState::Closing,
        CoreState::Closed,
        CoreState::Error,
    ];

    #[test]
    fn exactly_the_enumerated_transitions_are_legal() {
        use CoreState as S;
        let legal = [
            (S::Idle, S::Starting),
            (S::Starting, S::Active),
            (S::Starting, S::Error),
            (S::Active, S::Rotating),
            (S::Active, S::Closing),
            (S::Active, S::Error),
            (S::Rotating, S::Active),
            (S::Rotating, S::Error),
            (S::Closing, S::Closed),
            (S::Closing, S::Error),
            (S::Closed, S::Starting),
            (S::Error, S::Idle),
            (S::Error, S::Closed),
        ];

        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    transition_allowed(from, to),
                    expected,
                    "transition {from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn illegal_transition_leaves_state_unchanged() {
        let mut machine = StateMachine::new();
        let err = machine.transition_to(CoreState::Active);
        assert!(matches!(err, Err(CoreError::InvalidTransition { .. })));
        assert_eq!(machine.state(), CoreState::Idle);
    }

    #[test]
    fn full_lifecycle_walk() {
        let mut machine = StateMachine::new();
        for to in [
            CoreState::Starting,
            CoreState::Active,
            CoreState::Rotating,
            CoreState::Active,
            CoreState::Closing,
            CoreState::Closed,
            CoreState::Starting,
            CoreState::Active,
        ] {
            machine.transition_to(to).unwrap();
        }
        assert_eq!(machine.state(), CoreState::Active);
    }

    #[test]
    fn streams_only_open_in_active() {
        let mut machine = StateMachine::new();
        assert!(!machine.may_open_streams());
        machine.transition_to(CoreState::Starting).unwrap();
        assert!(!machine.may_open_streams());
        machine.transition_to(CoreState::Active).unwrap();
        assert!(machine.may_open_streams());
        machine.transition_to(CoreState::Rotating).unwrap();
        assert!(!machine.may_open_streams());
    }

    #[test]
    fn transition_reports_both_endpoints() {
        let mut machine = StateMachine::new();
        let event = machine.transition_to(CoreState::Starting).unwrap();
        assert!(matches!(
            event,
            EventKind::StateChanged { from: CoreState::Idle, to: CoreState::Starting }
        ));
    }

    #[test]
    fn error_recovers_only_to_idle_or_closed() {
        let mut machine = StateMachine::new();
        machine.transition_to(CoreState::Starting).unwrap();
        machine.transition_to(CoreState::Error).unwrap();
        assert!(matches!(
            machine.transition_to(CoreState::Active),
            Err(CoreError::InvalidTransition { .. })
        ));
        machine.transition_to(CoreState::Idle).unwrap();
    }
}
