//! Step validation and scoring.
//!
//! Steps are validated strictly in order. Every accepted call against the
//! current step counts one attempt, whatever the outcome. Re-validating a
//! step that is already complete replays the recorded result and changes
//! nothing.
//!
//! The criterion is evaluated without holding the state lock; the result is
//! committed afterwards under the write lock, after re-checking the status.
//! Criteria that run a check command in the environment take the session's
//! command slot first, so they fail with `Busy` while a command is running
//! and any teardown waits for them.

use std::sync::Arc;

use dojo_core::events::SessionEventKind;
use dojo_core::ids::{SessionId, StepId};
use dojo_core::session::SessionStatus;
use dojo_sandbox::SandboxError;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::RuntimeError;
use crate::execution::{claim_exec_slot, ensure_active};
use crate::lifecycle::{REASON_ALL_STEPS_COMPLETED, SessionManager};
use crate::store::{SessionEntry, SessionState};
use crate::validation::{ValidationContext, ValidationError, Verdict};

/// Result of a validation call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    /// Whether the step is complete.
    pub valid: bool,
    /// Human-readable explanation.
    pub feedback: String,
    /// Score awarded for the step, when complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_awarded: Option<u32>,
    /// Whether this was a replay of an already-completed step.
    pub replayed: bool,
    /// Session total after this call.
    pub total_score: u64,
    /// Index of the next step to validate.
    pub current_step_index: usize,
    /// Session status after this call.
    pub status: SessionStatus,
}

enum Commit {
    Replay(ValidationOutcome),
    Evaluated {
        outcome: ValidationOutcome,
        completed_session: bool,
    },
}

impl SessionManager {
    /// Validate `step_id`, which must be the session's current step.
    #[instrument(skip(self), fields(session_id = %id, step_id = %step_id))]
    pub async fn validate_step(
        &self,
        id: &SessionId,
        step_id: &StepId,
    ) -> Result<ValidationOutcome, RuntimeError> {
        let entry = self.lookup(id)?;
        let _ = self.enforce_expiry(&entry);
        let _gate = entry.validate_lock.lock().await;
        ensure_active(&entry)?;

        let position = check_step(&entry, step_id)?;
        if let Some(replay) = replay_if_completed(&entry, position) {
            debug!(session_id = %id, step_id = %step_id, "replaying completed step");
            return Ok(replay);
        }

        let step = entry.steps()[position].clone();
        let _slot = if step.criterion.runs_in_environment() {
            Some(claim_exec_slot(&entry)?)
        } else {
            None
        };
        let (history, env_id) = entry.read(|s| {
            (
                s.history.iter().cloned().collect::<Vec<_>>(),
                s.session.environment_id.clone(),
            )
        });
        let ctx = ValidationContext {
            session_id: id,
            step: &step,
            history: &history,
            environment_id: env_id.as_ref(),
            provisioner: self.provisioner.as_ref(),
            probe_timeout: self.config.default_timeout.min(self.config.max_timeout),
        };
        let evaluated = self.validators.evaluate(&ctx).await;

        let verdict = match evaluated {
            Ok(verdict) => verdict,
            Err(ValidationError::Sandbox(error)) => {
                let _ = self.commit(&entry, position, None)?;
                return Err(self.probe_failed(&entry, error));
            }
            Err(other) => {
                warn!(session_id = %id, step_id = %step_id, error = %other, "criterion could not be evaluated");
                Verdict::fail(format!("validation could not run: {other}"))
            }
        };

        match self.commit(&entry, position, Some(verdict))? {
            Commit::Replay(outcome) => Ok(outcome),
            Commit::Evaluated {
                outcome,
                completed_session,
            } => {
                counter!("dojo_validations_total", "valid" => if outcome.valid { "true" } else { "false" })
                    .increment(1);
                self.emit(
                    id,
                    SessionEventKind::StepValidated {
                        step_id: step_id.clone(),
                        valid: outcome.valid,
                        score_awarded: outcome.score_awarded,
                    },
                );
                if outcome.valid {
                    info!(session_id = %id, step_id = %step_id, score = outcome.score_awarded, "step completed");
                }
                if completed_session {
                    self.after_terminal(&entry, SessionStatus::Completed, REASON_ALL_STEPS_COMPLETED);
                }
                Ok(ValidationOutcome {
                    status: entry.status(),
                    ..outcome
                })
            }
        }
    }

    /// Count the attempt and apply the verdict. `None` counts the attempt only.
    fn commit(
        &self,
        entry: &SessionEntry,
        position: usize,
        verdict: Option<Verdict>,
    ) -> Result<Commit, RuntimeError> {
        let now = self.now();
        let step = &entry.steps()[position];
        entry.write(|s| {
            if s.session.status != SessionStatus::Active {
                return Err(RuntimeError::InvalidState {
                    session_id: s.session.id.clone(),
                    status: s.session.status,
                });
            }
            if s.session.progress[position].completed {
                return Ok(Commit::Replay(replay_outcome(s, position)));
            }

            let progress = &mut s.session.progress[position];
            progress.record_attempt();
            let attempts = progress.attempts;

            let Some(verdict) = verdict else {
                return Ok(Commit::Evaluated {
                    outcome: outcome_of(s, false, String::new(), None),
                    completed_session: false,
                });
            };
            if !verdict.valid {
                return Ok(Commit::Evaluated {
                    outcome: outcome_of(s, false, verdict.feedback, None),
                    completed_session: false,
                });
            }

            let score = self.scoring.award(step.points, attempts);
            s.session
                .complete_current_step(score, verdict.feedback.clone(), now);
            let completed_session = s.session.all_steps_completed()
                && s
                    .session
                    .finish(SessionStatus::Completed, REASON_ALL_STEPS_COMPLETED, now);
            Ok(Commit::Evaluated {
                outcome: outcome_of(s, true, verdict.feedback, Some(score)),
                completed_session,
            })
        })
    }

    fn probe_failed(&self, entry: &Arc<SessionEntry>, error: SandboxError) -> RuntimeError {
        if let SandboxError::EnvironmentLost { message, .. } = &error {
            let reason = format!("environment_lost: {message}");
            let _ = self.terminate(entry, SessionStatus::Failed, &reason);
        } else {
            warn!(session_id = %entry.id(), error = %error, "environment check failed");
        }
        RuntimeError::Execution {
            session_id: entry.id().clone(),
            status: entry.status(),
            message: error.to_string(),
        }
    }
}

/// Position of `step_id`, rejecting unknown and out-of-order steps.
/// Completed steps are accepted so they can be replayed.
fn check_step(entry: &SessionEntry, step_id: &StepId) -> Result<usize, RuntimeError> {
    entry.read(|s| {
        let session = &s.session;
        let position = session.step_position(step_id);
        match position {
            Some(p) if session.progress[p].completed || p == session.current_step_index => Ok(p),
            _ => Err(RuntimeError::InvalidStep {
                session_id: session.id.clone(),
                status: session.status,
                expected: session
                    .progress
                    .get(session.current_step_index)
                    .map(|p| p.step_id.clone()),
                requested: step_id.clone(),
            }),
        }
    })
}

fn replay_if_completed(entry: &SessionEntry, position: usize) -> Option<ValidationOutcome> {
    entry.read(|s| {
        s.session.progress[position]
            .completed
            .then(|| replay_outcome(s, position))
    })
}

fn replay_outcome(s: &SessionState, position: usize) -> ValidationOutcome {
    let progress = &s.session.progress[position];
    ValidationOutcome {
        valid: true,
        feedback: progress.feedback.clone().unwrap_or_default(),
        score_awarded: progress.score,
        replayed: true,
        total_score: s.session.total_score,
        current_step_index: s.session.current_step_index,
        status: s.session.status,
    }
}

fn outcome_of(
    s: &SessionState,
    valid: bool,
    feedback: String,
    score_awarded: Option<u32>,
) -> ValidationOutcome {
    ValidationOutcome {
        valid,
        feedback,
        score_awarded,
        replayed: false,
        total_score: s.session.total_score,
        current_step_index: s.session.current_step_index,
        status: s.session.status,
    }
}
