//! Supervisor state machine.
//!
//! ```text
//! NotStarted -> Starting -> Running -> Stopping -> Stopped
//!                  |           |                     |
//!                  v           v                     |
//!                Failed <------+     Starting <------+
//! ```
//!
//! `Failed` is reached from `Starting` when no port is announced in time
//! (or the companion exits first), and from `Running` when the companion
//! exits on its own. Both `Failed` and `Stopped` may start again.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::{CompanionError, CompanionResult};

const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::NotStarted => write!(f, "not_started"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Stopping => write!(f, "stopping"),
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Failed => write!(f, "failed"),
        }
    }
}

impl SupervisorState {
    /// States from which `start` may be called.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            SupervisorState::NotStarted | SupervisorState::Stopped | SupervisorState::Failed
        )
    }
}

/// A recorded state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from_state: SupervisorState,
    pub to_state: SupervisorState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SupervisorStateMachine {
    current_state: SupervisorState,
    history: Vec<StateTransition>,
}

impl Default for SupervisorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: SupervisorState::NotStarted,
            history: Vec::new(),
        }
    }

    pub fn current_state(&self) -> SupervisorState {
        self.current_state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn is_valid_transition(&self, target: SupervisorState) -> bool {
        use SupervisorState::*;

        match (self.current_state, target) {
            (NotStarted, Starting) => true,

            (Starting, Running) => true,
            (Starting, Failed) => true,
            // Startup cancelled by the caller
            (Starting, Stopped) => true,

            (Running, Stopping) => true,
            (Running, Failed) => true,

            (Stopping, Stopped) => true,

            (Stopped, Starting) => true,
            (Failed, Starting) => true,
            (Failed, Stopped) => true,

            (state, target) if state == target => true,
            _ => false,
        }
    }

    pub fn transition_to(
        &mut self,
        target: SupervisorState,
        reason: impl Into<String>,
    ) -> CompanionResult<()> {
        if !self.is_valid_transition(target) {
            return Err(CompanionError::InvalidTransition {
                from: self.current_state,
                to: target,
            });
        }

        let from = self.current_state;
        self.current_state = target;
        self.history.push(StateTransition {
            from_state: from,
            to_state: target,
            timestamp: Utc::now(),
            reason: Some(reason.into()),
        });

        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }

        tracing::debug!(from = %from, to = %target, "Supervisor state transition");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = SupervisorStateMachine::new();
        assert_eq!(sm.current_state(), SupervisorState::NotStarted);

        sm.transition_to(SupervisorState::Starting, "start").unwrap();
        sm.transition_to(SupervisorState::Running, "port announced").unwrap();
        sm.transition_to(SupervisorState::Stopping, "stop").unwrap();
        sm.transition_to(SupervisorState::Stopped, "exited").unwrap();
        sm.transition_to(SupervisorState::Starting, "restart").unwrap();

        assert_eq!(sm.history().len(), 5);
        assert_eq!(sm.history()[1].reason.as_deref(), Some("port announced"));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = SupervisorStateMachine::new();
        assert!(sm.transition_to(SupervisorState::Running, "skip").is_err());

        sm.transition_to(SupervisorState::Starting, "start").unwrap();
        sm.transition_to(SupervisorState::Running, "up").unwrap();
        let err = sm.transition_to(SupervisorState::Starting, "again").unwrap_err();
        assert!(matches!(
            err,
            CompanionError::InvalidTransition {
                from: SupervisorState::Running,
                to: SupervisorState::Starting
            }
        ));
    }

    #[test]
    fn test_failed_can_restart() {
        let mut sm = SupervisorStateMachine::new();
        sm.transition_to(SupervisorState::Starting, "start").unwrap();
        sm.transition_to(SupervisorState::Failed, "timeout").unwrap();
        assert!(sm.current_state().can_start());
        sm.transition_to(SupervisorState::Starting, "retry").unwrap();
    }

    #[test]
    fn test_history_bounded() {
        let mut sm = SupervisorStateMachine::new();
        for _ in 0..40 {
            sm.transition_to(SupervisorState::Starting, "start").unwrap();
            sm.transition_to(SupervisorState::Failed, "fail").unwrap();
        }
        assert_eq!(sm.history().len(), MAX_HISTORY);
    }
}
