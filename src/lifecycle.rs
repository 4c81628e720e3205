//! Lifecycle state and process exit codes shared by sources, targets and
//! the orchestrator.

use std::fmt;

/// Lifecycle of a source, a target or the orchestrator itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    /// Started and not yet asked to stop
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    /// Uncaught runtime fault
    pub const ERROR: ExitCode = ExitCode(1);

    /// POSIX convention for termination by signal `signal`
    pub fn from_signal(signal: i32) -> Self {
        ExitCode(128 + signal)
    }

    pub fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Only a runtime fault is logged as an error; signal exits are not
    pub fn is_fault(self) -> bool {
        self == ExitCode::ERROR
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_signal() {
        assert_eq!(ExitCode::from_signal(libc::SIGINT), ExitCode(130));
        assert_eq!(ExitCode::from_signal(libc::SIGTERM), ExitCode(143));
        assert_eq!(ExitCode::from_signal(libc::SIGHUP), ExitCode(129));
    }

    #[test]
    fn test_exit_code_is_error() {
        assert!(!ExitCode::SUCCESS.is_error());
        assert!(ExitCode::ERROR.is_error());
        assert!(ExitCode::from_signal(libc::SIGTERM).is_error());
    }

    #[test]
    fn test_only_runtime_fault_is_fault() {
        assert!(ExitCode::ERROR.is_fault());
        assert!(!ExitCode::SUCCESS.is_fault());
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            assert!(!ExitCode::from_signal(signal).is_fault());
        }
    }

    #[test]
    fn test_active_states() {
        assert!(LifecycleState::Starting.is_active());
        assert!(LifecycleState::Running.is_active());
        assert!(!LifecycleState::Stopping.is_active());
        assert!(!LifecycleState::Stopped.is_active());
    }
}
