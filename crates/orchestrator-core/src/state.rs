//! Engine run state

use std::fmt;

use serde::{Deserialize, Serialize};

/// Run state of the orchestration engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    /// Components wired, background loops not started
    Starting,

    /// Background loops running, accepting transactions
    Running,

    /// Shutdown in progress, new transactions rejected
    Stopping,

    /// Every background loop has exited
    Stopped,

    /// Startup failed
    Error(String),
}

impl OrchestratorState {
    pub fn new() -> Self {
        OrchestratorState::Starting
    }

    pub fn is_running(&self) -> bool {
        matches!(self, OrchestratorState::Running)
    }

    pub fn is_starting(&self) -> bool {
        matches!(self, OrchestratorState::Starting)
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self, OrchestratorState::Stopping)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, OrchestratorState::Stopped)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OrchestratorState::Error(_))
    }

    /// Gets the error message if in error state
    pub fn error_message(&self) -> Option<&str> {
        match self {
            OrchestratorState::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns true if the engine may move from this state to `next`
    pub fn can_transition_to(&self, next: &OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Error(_))
                | (Running, Stopping)
                | (Running, Error(_))
                | (Stopping, Stopped)
                | (Error(_), Stopping)
                | (Error(_), Stopped)
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Starting => write!(f, "Starting"),
            OrchestratorState::Running => write!(f, "Running"),
            OrchestratorState::Stopping => write!(f, "Stopping"),
            OrchestratorState::Stopped => write!(f, "Stopped"),
            OrchestratorState::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let starting = OrchestratorState::Starting;
        assert!(starting.can_transition_to(&OrchestratorState::Running));
        assert!(!starting.can_transition_to(&OrchestratorState::Stopped));
        assert!(!OrchestratorState::Stopped.can_transition_to(&OrchestratorState::Running));
        assert!(OrchestratorState::Error("boom".into()).can_transition_to(&OrchestratorState::Stopped));
        assert_eq!(OrchestratorState::Error("boom".into()).to_string(), "Error: boom");
    }
}
