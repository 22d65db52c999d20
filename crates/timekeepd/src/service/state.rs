//! Service lifecycle states and the control transition table.

use std::fmt;

/// Lifecycle state reported to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control request from the service manager or a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Interrogate,
    Stop,
    Shutdown,
    Pause,
    Continue,
    /// Anything else the host sent, by its raw code
    Other(u32),
}

/// Work the orchestrator performs for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Re-send the current status
    Report,
    /// Stop heartbeat and monitor, keep session state
    Suspend,
    /// Resync the monitor and restart heartbeat
    Resume,
    /// Cancel all tasks and close storage
    Shutdown,
    /// Log and do nothing
    Ignore,
}

/// Outcome of feeding one request to [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub action: Action,
    pub next: ServiceState,
}

impl Step {
    fn stay(state: ServiceState, action: Action) -> Self {
        Self {
            action,
            next: state,
        }
    }
}

/// The control transition table.
///
/// Requests arriving outside `Running` or `Paused` are ignored; the
/// orchestrator only listens while in one of those two states.
pub fn transition(state: ServiceState, request: ControlRequest) -> Step {
    use ControlRequest as R;
    use ServiceState as S;

    match (state, request) {
        (S::Running | S::Paused, R::Interrogate) => Step::stay(state, Action::Report),
        (S::Running | S::Paused, R::Stop | R::Shutdown) => Step {
            action: Action::Shutdown,
            next: S::Stopping,
        },
        (S::Running, R::Pause) => Step {
            action: Action::Suspend,
            next: S::Paused,
        },
        (S::Paused, R::Continue) => Step {
            action: Action::Resume,
            next: S::Running,
        },
        _ => Step::stay(state, Action::Ignore),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_transitions() {
        let s = ServiceState::Running;
        assert_eq!(transition(s, ControlRequest::Interrogate).action, Action::Report);
        assert_eq!(
            transition(s, ControlRequest::Pause),
            Step {
                action: Action::Suspend,
                next: ServiceState::Paused
            }
        );
        for request in [ControlRequest::Stop, ControlRequest::Shutdown] {
            let step = transition(s, request);
            assert_eq!(step.action, Action::Shutdown);
            assert_eq!(step.next, ServiceState::Stopping);
        }
    }

    #[test]
    fn test_paused_transitions() {
        let s = ServiceState::Paused;
        assert_eq!(
            transition(s, ControlRequest::Continue),
            Step {
                action: Action::Resume,
                next: ServiceState::Running
            }
        );
        assert_eq!(transition(s, ControlRequest::Interrogate).next, s);
        assert_eq!(transition(s, ControlRequest::Shutdown).action, Action::Shutdown);
    }

    #[test]
    fn test_redundant_requests_are_ignored() {
        assert_eq!(
            transition(ServiceState::Paused, ControlRequest::Pause),
            Step::stay(ServiceState::Paused, Action::Ignore)
        );
        assert_eq!(
            transition(ServiceState::Running, ControlRequest::Continue),
            Step::stay(ServiceState::Running, Action::Ignore)
        );
    }

    #[test]
    fn test_unrecognized_request_leaves_state() {
        for state in [ServiceState::Running, ServiceState::Paused] {
            assert_eq!(
                transition(state, ControlRequest::Other(0x40)),
                Step::stay(state, Action::Ignore)
            );
        }
    }

    #[test]
    fn test_terminal_states_ignore_everything() {
        for state in [ServiceState::Stopping, ServiceState::Stopped] {
            assert_eq!(transition(state, ControlRequest::Continue).action, Action::Ignore);
            assert_eq!(transition(state, ControlRequest::Stop).next, state);
        }
    }
}
