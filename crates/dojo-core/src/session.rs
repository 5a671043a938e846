//! Session data model.
//!
//! A [`Session`] is one user's timed attempt at one workshop. The pure
//! transition helpers here enforce the model invariants; the runtime decides
//! *when* to call them.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::ids::{EnvironmentId, SessionId, StepId, UserId, WorkshopId};

/// Session state machine status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Environment is being provisioned.
    Starting,
    /// Accepting commands and validations.
    Active,
    /// All steps validated, or ended by the user.
    Completed,
    /// Provisioning failed or the environment was lost.
    Failed,
    /// TTL elapsed.
    Expired,
}

impl SessionStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress on a single workshop step.
///
/// `completed == true` implies `score` and `completed_at` are set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    /// Step this entry tracks.
    pub step_id: StepId,
    /// Whether the step has been validated.
    pub completed: bool,
    /// Awarded score, set on completion.
    pub score: Option<u32>,
    /// Validation calls made against this step.
    pub attempts: u32,
    /// When the step was validated.
    pub completed_at: Option<DateTime<Utc>>,
    /// Feedback recorded with the successful validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl StepProgress {
    /// An unstarted entry.
    pub fn pending(step_id: StepId) -> Self {
        Self {
            step_id,
            completed: false,
            score: None,
            attempts: 0,
            completed_at: None,
            feedback: None,
        }
    }

    /// Count one validation call.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Mark the step complete with its awarded score.
    pub fn mark_completed(&mut self, score: u32, feedback: String, at: DateTime<Utc>) {
        self.completed = true;
        self.score = Some(score);
        self.completed_at = Some(at);
        self.feedback = Some(feedback);
    }
}

/// One command run against a session's environment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandExecution {
    /// The command as submitted.
    pub command: String,
    /// Combined stdout/stderr (possibly truncated or partial).
    pub output: String,
    /// Exit code; synthetic when the command timed out.
    pub exit_code: i32,
    /// Wall time spent waiting for the environment.
    pub duration_ms: u64,
    /// When the command finished.
    pub timestamp: DateTime<Utc>,
    /// Whether the timeout elapsed before the command finished.
    #[serde(default)]
    pub timed_out: bool,
}

/// A live workshop attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque session token.
    pub id: SessionId,
    /// Workshop being attempted.
    pub workshop_id: WorkshopId,
    /// User attempting it.
    pub user_id: UserId,
    /// Current state.
    pub status: SessionStatus,
    /// Index of the next step to validate; equals `progress.len()` when done.
    pub current_step_index: usize,
    /// Sum of awarded step scores.
    pub total_score: u64,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// `started_at + ttl`, fixed at creation.
    pub expires_at: DateTime<Utc>,
    /// Set when the session reaches `completed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the session reaches any terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the session ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
    /// Environment backing this session, once provisioned.
    pub environment_id: Option<EnvironmentId>,
    /// One entry per workshop step, fixed length.
    pub progress: Vec<StepProgress>,
}

impl Session {
    /// A new session in `starting` with one pending entry per step.
    pub fn starting(
        id: SessionId,
        workshop_id: WorkshopId,
        user_id: UserId,
        steps: impl IntoIterator<Item = StepId>,
        started_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id,
            workshop_id,
            user_id,
            status: SessionStatus::Starting,
            current_step_index: 0,
            total_score: 0,
            started_at,
            expires_at: started_at + ttl,
            completed_at: None,
            ended_at: None,
            end_reason: None,
            environment_id: None,
            progress: steps.into_iter().map(StepProgress::pending).collect(),
        }
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now >= self.expires_at
    }

    /// Whether every step has been validated.
    pub fn all_steps_completed(&self) -> bool {
        self.progress.iter().all(|p| p.completed)
    }

    /// Position of `step_id` in the progress array.
    pub fn step_position(&self, step_id: &StepId) -> Option<usize> {
        self.progress.iter().position(|p| &p.step_id == step_id)
    }

    /// Move `starting` → `active`. Returns `false` if the session is not starting.
    pub fn activate(&mut self, environment_id: EnvironmentId) -> bool {
        if self.status != SessionStatus::Starting {
            return false;
        }
        self.status = SessionStatus::Active;
        self.environment_id = Some(environment_id);
        true
    }

    /// Enter a terminal status.
    ///
    /// Returns `false` (and changes nothing) if already terminal, so the
    /// first writer to reach a terminal status wins.
    pub fn finish(&mut self, status: SessionStatus, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_at = Some(now);
        self.end_reason = Some(reason.into());
        if status == SessionStatus::Completed {
            self.completed_at = Some(now);
        }
        true
    }

    /// Record a successful validation of the current step and advance.
    ///
    /// The caller must already have counted the attempt.
    pub fn complete_current_step(&mut self, score: u32, feedback: String, now: DateTime<Utc>) {
        let Some(entry) = self.progress.get_mut(self.current_step_index) else {
            return;
        };
        entry.mark_completed(score, feedback, now);
        self.total_score = self.total_score.saturating_add(u64::from(score));
        self.current_step_index = (self.current_step_index + 1).min(self.progress.len());
    }
}

/// Consistent point-in-time view returned by status polling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session record.
    pub session: Session,
    /// Environment as last observed.
    pub environment: Option<Environment>,
    /// Whether a command is currently running.
    pub command_in_flight: bool,
    /// Recent command executions, oldest first.
    pub history: Vec<CommandExecution>,
}
