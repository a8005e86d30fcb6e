// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lifecycle state machines with typed state transitions.
//!
//! Compute system: Created → Starting → Running → ShuttingDown|Killing → Exited.
//! Process: Running → Exited.
//! Invalid transitions result in StateTransitionError.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;

/// A lifecycle state enum usable with [`StateMachine`].
pub trait LifecycleState: Copy + Eq + fmt::Debug {
    /// Get the state name for error messages.
    fn name(&self) -> &'static str;

    /// Check if transition to the target state is valid.
    fn can_transition_to(&self, target: Self) -> bool;

    /// Terminal states accept no further transitions.
    fn is_terminal(&self) -> bool;
}

/// Compute system lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    /// Created or opened, not started by this object.
    Created,

    /// A start request is in flight.
    Starting,

    /// Start completed.
    Running,

    /// A graceful shutdown request is in flight.
    ShuttingDown,

    /// A forceful terminate request is in flight.
    Killing,

    /// The system has exited.
    Exited,
}

impl LifecycleState for SystemState {
    fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Killing => "Killing",
            Self::Exited => "Exited",
        }
    }

    fn can_transition_to(&self, target: SystemState) -> bool {
        matches!(
            (self, target),
            // From Created
            (Self::Created, Self::Starting) |
            (Self::Created, Self::ShuttingDown) |
            (Self::Created, Self::Killing) |
            (Self::Created, Self::Exited) |
            // From Starting (a failed start falls back to Created)
            (Self::Starting, Self::Running) |
            (Self::Starting, Self::Created) |
            (Self::Starting, Self::ShuttingDown) |
            (Self::Starting, Self::Killing) |
            (Self::Starting, Self::Exited) |
            // From Running
            (Self::Running, Self::ShuttingDown) |
            (Self::Running, Self::Killing) |
            (Self::Running, Self::Exited) |
            // From ShuttingDown (a timed out shutdown can still be killed)
            (Self::ShuttingDown, Self::Killing) |
            (Self::ShuttingDown, Self::Exited) |
            // From Killing
            (Self::Killing, Self::Exited)
        )
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    Exited,
}

impl LifecycleState for ProcessState {
    fn name(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Exited => "Exited",
        }
    }

    fn can_transition_to(&self, target: ProcessState) -> bool {
        matches!((self, target), (Self::Running, Self::Exited))
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for one lifecycle object.
/// Enforces valid state transitions and tracks timing.
#[derive(Debug)]
pub struct StateMachine<S: LifecycleState> {
    subject: String,
    current_state: S,
    last_transition: Instant,
    transition_count: u64,
}

impl<S: LifecycleState> StateMachine<S> {
    /// Create a new state machine for `subject` (used in logs and errors).
    pub fn new(subject: impl Into<String>, initial: S) -> Self {
        Self {
            subject: subject.into(),
            current_state: initial,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    pub fn state(&self) -> S {
        self.current_state
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.last_transition.elapsed()
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    /// A transition to the current state is accepted as a no-op.
    pub fn transition_to(&mut self, target: S) -> Result<(), StateTransitionError> {
        if self.current_state == target {
            return Ok(());
        }

        if self.current_state.is_terminal() {
            return Err(StateTransitionError::TerminalState {
                subject: self.subject.clone(),
                state: self.current_state.name(),
            });
        }

        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                subject: self.subject.clone(),
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            subject = %self.subject,
            from = self.current_state.name(),
            to = target.name(),
            time_in_state_ms = self.time_in_current_state().as_millis() as u64,
            "State transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new("box", SystemState::Created);
        assert_eq!(sm.state(), SystemState::Created);
        assert_eq!(sm.transition_count(), 0);
    }

    #[test]
    fn test_valid_system_transitions() {
        let mut sm = StateMachine::new("box", SystemState::Created);

        assert!(sm.transition_to(SystemState::Starting).is_ok());
        assert!(sm.transition_to(SystemState::Running).is_ok());
        assert!(sm.transition_to(SystemState::ShuttingDown).is_ok());
        assert!(sm.transition_to(SystemState::Killing).is_ok());
        assert!(sm.transition_to(SystemState::Exited).is_ok());
        assert_eq!(sm.transition_count(), 5);
    }

    #[test]
    fn test_failed_start_returns_to_created() {
        let mut sm = StateMachine::new("box", SystemState::Created);
        sm.transition_to(SystemState::Starting).unwrap();
        assert!(sm.transition_to(SystemState::Created).is_ok());
        assert!(sm.transition_to(SystemState::Starting).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = StateMachine::new("box", SystemState::Created);
        assert!(sm.transition_to(SystemState::Running).is_err());
        assert_eq!(sm.state(), SystemState::Created);

        sm.transition_to(SystemState::Exited).unwrap();
        assert!(matches!(
            sm.transition_to(SystemState::Starting),
            Err(StateTransitionError::TerminalState { .. })
        ));
    }

    #[test]
    fn test_time_in_state_resets_on_transition() {
        let mut sm = StateMachine::new("box", SystemState::Created);
        std::thread::sleep(Duration::from_millis(30));
        assert!(sm.time_in_current_state() >= Duration::from_millis(30));

        sm.transition_to(SystemState::Starting).unwrap();
        assert!(sm.time_in_current_state() < Duration::from_millis(30));
    }

    #[test]
    fn test_same_state_is_noop() {
        let mut sm = StateMachine::new("proc", ProcessState::Running);
        assert!(sm.transition_to(ProcessState::Running).is_ok());
        assert_eq!(sm.transition_count(), 0);

        sm.transition_to(ProcessState::Exited).unwrap();
        assert!(sm.transition_to(ProcessState::Exited).is_ok());
        assert_eq!(sm.transition_count(), 1);
    }
}
