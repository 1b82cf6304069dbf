//! ProcessState value object
//! Lifecycle of a supervised OS process

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessState {
    /// Configured, never started.
    #[default]
    Created,
    /// Child process is alive.
    Running,
    /// Terminated on its own.
    Exited,
    /// Terminated after a kill request.
    Killed,
    /// Terminated after a close request.
    Closed,
    /// OS handles freed; terminal.
    ResourcesReleased,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        self == ProcessState::Running
    }

    pub fn has_terminated(self) -> bool {
        matches!(
            self,
            ProcessState::Exited
                | ProcessState::Killed
                | ProcessState::Closed
                | ProcessState::ResourcesReleased
        )
    }

    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Exited)
                | (Running, Killed)
                | (Running, Closed)
                | (Exited, Running)
                | (Killed, Running)
                | (Closed, Running)
                | (Created, ResourcesReleased)
                | (Exited, ResourcesReleased)
                | (Killed, ResourcesReleased)
                | (Closed, ResourcesReleased)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Created => write!(f, "created"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited => write!(f, "exited"),
            ProcessState::Killed => write!(f, "killed"),
            ProcessState::Closed => write!(f, "closed"),
            ProcessState::ResourcesReleased => write!(f, "resources-released"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_allowed_after_termination_only() {
        assert!(ProcessState::Created.can_transition_to(ProcessState::Running));
        assert!(ProcessState::Exited.can_transition_to(ProcessState::Running));
        assert!(ProcessState::Killed.can_transition_to(ProcessState::Running));
        assert!(!ProcessState::Running.can_transition_to(ProcessState::Running));
        assert!(!ProcessState::ResourcesReleased.can_transition_to(ProcessState::Running));
    }

    #[test]
    fn test_release_requires_termination() {
        assert!(!ProcessState::Running.can_transition_to(ProcessState::ResourcesReleased));
        assert!(ProcessState::Closed.can_transition_to(ProcessState::ResourcesReleased));
        assert!(ProcessState::Closed.has_terminated());
        assert!(!ProcessState::Created.has_terminated());
    }
}
