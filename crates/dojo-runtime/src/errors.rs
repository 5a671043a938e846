//! Runtime error types.
//!
//! Every session-scoped variant carries the session id and the status the
//! session was in when the operation was refused, so callers can decide
//! whether to retry, poll, or abandon.

use dojo_core::ids::{SessionId, StepId, WorkshopId};
use dojo_core::session::SessionStatus;

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Unknown session, or reaped after its retention window.
    #[error("session not found: {session_id}")]
    NotFound {
        /// Requested session.
        session_id: SessionId,
    },

    /// Operation not valid for the session's current status.
    #[error("session {session_id} is {status}")]
    InvalidState {
        /// Affected session.
        session_id: SessionId,
        /// Status at the time of the call.
        status: SessionStatus,
    },

    /// Validation requested for a step other than the current one.
    #[error("session {session_id}: step {requested} is not the current step")]
    InvalidStep {
        /// Affected session.
        session_id: SessionId,
        /// Status at the time of the call.
        status: SessionStatus,
        /// Step that is due next, if any.
        expected: Option<StepId>,
        /// Step the caller asked for.
        requested: StepId,
    },

    /// A command is already in flight for this session.
    #[error("session {session_id} already has a command in flight")]
    Busy {
        /// Affected session.
        session_id: SessionId,
        /// Status at the time of the call.
        status: SessionStatus,
    },

    /// The command exceeded its timeout; the session stays active.
    #[error("command in session {session_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Affected session.
        session_id: SessionId,
        /// Status after the timeout was recorded.
        status: SessionStatus,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The environment could not be provisioned; the session is `failed`.
    #[error("provisioning failed for session {session_id}: {message}")]
    Provision {
        /// The failed session (still queryable until reaped).
        session_id: SessionId,
        /// Provider-supplied cause.
        message: String,
    },

    /// The sandbox failed to run a command or probe.
    #[error("execution failed in session {session_id}: {message}")]
    Execution {
        /// Affected session.
        session_id: SessionId,
        /// Status after the failure was handled.
        status: SessionStatus,
        /// Provider-supplied cause.
        message: String,
    },

    /// Too many live sessions.
    #[error("session capacity reached ({limit} live sessions)")]
    CapacityExceeded {
        /// Configured limit.
        limit: usize,
    },

    /// The catalog has no such workshop.
    #[error("workshop not found: {0}")]
    WorkshopNotFound(WorkshopId),

    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RuntimeError {
    /// Whether retrying the same call later can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Busy { .. }
            | Self::Timeout { .. }
            | Self::Execution { .. }
            | Self::CapacityExceeded { .. } => true,
            Self::NotFound { .. }
            | Self::InvalidState { .. }
            | Self::InvalidStep { .. }
            | Self::Provision { .. }
            | Self::WorkshopNotFound(_)
            | Self::InvalidRequest(_) => false,
        }
    }

    /// Stable snake_case error code.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidStep { .. } => "invalid_step",
            Self::Busy { .. } => "busy",
            Self::Timeout { .. } => "timeout",
            Self::Provision { .. } => "provision_error",
            Self::Execution { .. } => "execution_error",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::WorkshopNotFound(_) => "workshop_not_found",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Session the error refers to, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::NotFound { session_id }
            | Self::InvalidState { session_id, .. }
            | Self::InvalidStep { session_id, .. }
            | Self::Busy { session_id, .. }
            | Self::Timeout { session_id, .. }
            | Self::Provision { session_id, .. }
            | Self::Execution { session_id, .. } => Some(session_id),
            Self::CapacityExceeded { .. } | Self::WorkshopNotFound(_) | Self::InvalidRequest(_) => {
                None
            }
        }
    }

    /// Session status observed when the error was produced, if known.
    pub fn status(&self) -> Option<SessionStatus> {
        match self {
            Self::InvalidState { status, .. }
            | Self::InvalidStep { status, .. }
            | Self::Busy { status, .. }
            | Self::Timeout { status, .. }
            | Self::Execution { status, .. } => Some(*status),
            Self::Provision { .. } => Some(SessionStatus::Failed),
            Self::NotFound { .. }
            | Self::CapacityExceeded { .. }
            | Self::WorkshopNotFound(_)
            | Self::InvalidRequest(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::from("sess-1")
    }

    #[test]
    fn display_includes_session_and_status() {
        let err = RuntimeError::InvalidState {
            session_id: sid(),
            status: SessionStatus::Expired,
        };
        assert_eq!(err.to_string(), "session sess-1 is expired");

        let err = RuntimeError::Timeout {
            session_id: sid(),
            status: SessionStatus::Active,
            timeout_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "command in session sess-1 timed out after 250ms"
        );
    }

    #[test]
    fn categories() {
        assert_eq!(RuntimeError::NotFound { session_id: sid() }.category(), "not_found");
        assert_eq!(
            RuntimeError::Busy {
                session_id: sid(),
                status: SessionStatus::Active
            }
            .category(),
            "busy"
        );
        assert_eq!(
            RuntimeError::CapacityExceeded { limit: 3 }.category(),
            "capacity_exceeded"
        );
        assert_eq!(
            RuntimeError::InvalidRequest("x".into()).category(),
            "invalid_request"
        );
    }

    #[test]
    fn recoverability() {
        assert!(
            RuntimeError::Busy {
                session_id: sid(),
                status: SessionStatus::Active
            }
            .is_recoverable()
        );
        assert!(
            RuntimeError::Timeout {
                session_id: sid(),
                status: SessionStatus::Active,
                timeout_ms: 1
            }
            .is_recoverable()
        );
        assert!(
            !RuntimeError::Provision {
                session_id: sid(),
                message: "x".into()
            }
            .is_recoverable()
        );
        assert!(
            !RuntimeError::InvalidState {
                session_id: sid(),
                status: SessionStatus::Completed
            }
            .is_recoverable()
        );
    }

    #[test]
    fn context_accessors() {
        let err = RuntimeError::InvalidStep {
            session_id: sid(),
            status: SessionStatus::Active,
            expected: Some(StepId::from("b")),
            requested: StepId::from("c"),
        };
        assert_eq!(err.session_id().map(SessionId::as_str), Some("sess-1"));
        assert_eq!(err.status(), Some(SessionStatus::Active));

        let err = RuntimeError::Provision {
            session_id: sid(),
            message: "no capacity".into(),
        };
        assert_eq!(err.status(), Some(SessionStatus::Failed));

        let err = RuntimeError::WorkshopNotFound(WorkshopId::from("w"));
        assert!(err.session_id().is_none());
        assert!(err.status().is_none());
    }
}
