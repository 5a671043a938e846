//! Sandbox error types.

use std::io;

use dojo_core::ids::EnvironmentId;
use thiserror::Error;

/// Errors reported by a provisioner backend.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The provider could not create an environment.
    #[error("provisioning failed: {message}")]
    Provision {
        /// Provider-supplied cause.
        message: String,
    },

    /// A command could not be dispatched or its result could not be read.
    #[error("command execution failed: {message}")]
    Execution {
        /// Provider-supplied cause.
        message: String,
    },

    /// The command did not finish within its timeout.
    #[error("command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
        /// Output captured before the deadline, if the provider returned any.
        partial_output: Option<String>,
    },

    /// The environment no longer exists or is permanently broken.
    #[error("environment {environment_id} lost: {message}")]
    EnvironmentLost {
        /// Affected environment.
        environment_id: EnvironmentId,
        /// Provider-supplied cause.
        message: String,
    },

    /// Teardown did not complete.
    #[error("teardown of {environment_id} failed: {message}")]
    Teardown {
        /// Affected environment.
        environment_id: EnvironmentId,
        /// Provider-supplied cause.
        message: String,
    },

    /// Local I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SandboxError {
    /// Whether the environment can no longer be used.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::EnvironmentLost { .. })
    }

    /// Error category string for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Provision { .. } => "provision",
            Self::Execution { .. } => "execution",
            Self::Timeout { .. } => "timeout",
            Self::EnvironmentLost { .. } => "environment_lost",
            Self::Teardown { .. } => "teardown",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = SandboxError::Timeout {
            timeout_ms: 500,
            partial_output: None,
        };
        assert_eq!(err.to_string(), "command timed out after 500ms");

        let err = SandboxError::EnvironmentLost {
            environment_id: EnvironmentId::from("env-9"),
            message: "container exited".into(),
        };
        assert_eq!(err.to_string(), "environment env-9 lost: container exited");
    }

    #[test]
    fn only_lost_environment_is_unrecoverable() {
        assert!(
            SandboxError::EnvironmentLost {
                environment_id: EnvironmentId::from("e"),
                message: String::new(),
            }
            .is_unrecoverable()
        );
        assert!(!SandboxError::Execution { message: "x".into() }.is_unrecoverable());
        assert!(
            !SandboxError::Timeout {
                timeout_ms: 1,
                partial_output: None
            }
            .is_unrecoverable()
        );
    }

    #[test]
    fn categories() {
        assert_eq!(SandboxError::Provision { message: "x".into() }.category(), "provision");
        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(SandboxError::from(io).category(), "io");
    }
}
