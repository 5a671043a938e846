//! Session lifecycle events.
//!
//! Published on a broadcast channel so a transport can push state changes
//! to clients. Polling the snapshot stays authoritative; events are hints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, StepId};
use crate::session::SessionStatus;

/// Something that happened to a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEventKind {
    /// Session record created in `starting`.
    Created,
    /// Environment ready, session `active`.
    Activated,
    /// A command finished (or timed out).
    #[serde(rename_all = "camelCase")]
    CommandExecuted {
        /// Exit code recorded.
        exit_code: i32,
        /// Whether the command timed out.
        timed_out: bool,
    },
    /// A validation call was evaluated.
    #[serde(rename_all = "camelCase")]
    StepValidated {
        /// Step that was checked.
        step_id: StepId,
        /// Whether it passed.
        valid: bool,
        /// Score awarded on success.
        score_awarded: Option<u32>,
    },
    /// Entered a terminal status.
    #[serde(rename_all = "camelCase")]
    Terminated {
        /// Terminal status reached.
        status: SessionStatus,
        /// Recorded end reason.
        reason: String,
    },
    /// Removed from the store after the retention window.
    Reaped,
}

/// Envelope carrying the session id and emission time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    /// Build an event.
    pub fn new(session_id: SessionId, timestamp: DateTime<Utc>, kind: SessionEventKind) -> Self {
        Self {
            session_id,
            timestamp,
            kind,
        }
    }

    /// Short name of the event type, e.g. `"stepValidated"`.
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            SessionEventKind::Created => "created",
            SessionEventKind::Activated => "activated",
            SessionEventKind::CommandExecuted { .. } => "commandExecuted",
            SessionEventKind::StepValidated { .. } => "stepValidated",
            SessionEventKind::Terminated { .. } => "terminated",
            SessionEventKind::Reaped => "reaped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattened_wire_format() {
        let ev = SessionEvent::new(
            SessionId::from("s1"),
            Utc::now(),
            SessionEventKind::StepValidated {
                step_id: StepId::from("a"),
                valid: true,
                score_awarded: Some(10),
            },
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["sessionId"], "s1");
        assert_eq!(v["type"], "stepValidated");
        assert_eq!(v["stepId"], "a");
        assert_eq!(v["scoreAwarded"], 10);
        assert_eq!(ev.event_type(), "stepValidated");
    }

    #[test]
    fn terminated_carries_status() {
        let ev = SessionEvent::new(
            SessionId::from("s1"),
            Utc::now(),
            SessionEventKind::Terminated {
                status: SessionStatus::Expired,
                reason: "ttl_elapsed".into(),
            },
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "terminated");
        assert_eq!(v["status"], "expired");
        let back: SessionEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }
}
