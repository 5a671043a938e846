//! Command execution coordinator.
//!
//! At most one command runs per session, counting environment checks run by
//! validation. A second `execute` while one is in flight fails with `Busy`
//! instead of queueing. Timed-out commands are still recorded, with exit code
//! [`TIMEOUT_EXIT_CODE`] and whatever partial output the provider returned.
//!
//! The provider is handed the command timeout itself; the engine only gives
//! up [`TIMEOUT_GRACE`] later, so a provider that kills the command on time
//! can still deliver its partial output.

use std::sync::Arc;
use std::time::Duration;

use dojo_core::events::SessionEventKind;
use dojo_core::ids::SessionId;
use dojo_core::session::{CommandExecution, SessionStatus};
use dojo_sandbox::SandboxError;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::errors::RuntimeError;
use crate::lifecycle::SessionManager;
use crate::store::SessionEntry;

/// Exit code recorded for commands that hit their timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long past a command timeout the engine waits for the provider's answer.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

const TRUNCATION_MARKER: &str = "…[truncated]";

/// Result of a completed command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Combined output, possibly truncated.
    pub output: String,
    /// Process exit code.
    pub exit_code: i32,
    /// Wall time spent waiting for the environment.
    pub duration_ms: u64,
}

/// Clears the in-flight flag when the command finishes or is cancelled.
struct InFlight<'a>(&'a SessionEntry);

/// The session's single command slot. The in-flight flag is cleared before
/// the lock is released.
pub(crate) struct ExecSlot<'a> {
    _in_flight: InFlight<'a>,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

/// Take the command slot without waiting.
///
/// Fails with `Busy` while another command runs, or with `InvalidState` if
/// the session is no longer active.
pub(crate) fn claim_exec_slot(entry: &SessionEntry) -> Result<ExecSlot<'_>, RuntimeError> {
    let Ok(guard) = entry.exec_lock.try_lock() else {
        // A pending teardown also holds the lock; report the terminal status.
        ensure_active(entry)?;
        return Err(RuntimeError::Busy {
            session_id: entry.id().clone(),
            status: entry.status(),
        });
    };
    // The session may have ended while we were acquiring the lock.
    ensure_active(entry)?;
    Ok(ExecSlot {
        _in_flight: InFlight::mark(entry),
        _guard: guard,
    })
}

impl<'a> InFlight<'a> {
    fn mark(entry: &'a SessionEntry) -> Self {
        entry.set_in_flight(true);
        Self(entry)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set_in_flight(false);
    }
}

impl SessionManager {
    /// Run `command` in the session's environment.
    ///
    /// `timeout` is clamped to the configured maximum; `None` or zero means
    /// the configured default.
    #[instrument(skip(self, command), fields(session_id = %id))]
    pub async fn execute(
        &self,
        id: &SessionId,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, RuntimeError> {
        let entry = self.lookup(id)?;
        let _ = self.enforce_expiry(&entry);
        ensure_active(&entry)?;
        if command.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest("command must not be empty".into()));
        }

        let _slot = claim_exec_slot(&entry).inspect_err(|e| {
            if matches!(e, RuntimeError::Busy { .. }) {
                counter!("dojo_commands_total", "outcome" => "busy").increment(1);
            }
        })?;
        let Some(env_id) = entry.read(|s| s.session.environment_id.clone()) else {
            return Err(invalid_state(&entry));
        };

        let timeout = self.resolve_timeout(timeout);
        let timeout_ms = millis(timeout);
        debug!(session_id = %id, command, timeout_ms, "dispatching command");

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout + TIMEOUT_GRACE,
            self.provisioner.run_command(&env_id, command, timeout),
        )
        .await;
        let duration_ms = millis(started.elapsed());
        histogram!("dojo_command_duration_seconds").record(started.elapsed().as_secs_f64());

        let result = match outcome {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(SandboxError::Timeout { partial_output, .. })) => Err(partial_output),
            Err(_elapsed) => Err(None),
            Ok(Err(e)) => return Err(self.execution_failed(&entry, e)),
        };

        match result {
            Ok(out) => {
                let output = truncate_output(out.output, self.config.max_output_bytes);
                self.record(&entry, command, output.clone(), out.exit_code, duration_ms, false);
                counter!("dojo_commands_total", "outcome" => "completed").increment(1);
                debug!(session_id = %id, exit_code = out.exit_code, duration_ms, "command finished");
                Ok(ExecutionResult {
                    output,
                    exit_code: out.exit_code,
                    duration_ms,
                })
            }
            Err(partial) => {
                let output = truncate_output(partial.unwrap_or_default(), self.config.max_output_bytes);
                self.record(&entry, command, output, TIMEOUT_EXIT_CODE, duration_ms, true);
                counter!("dojo_commands_total", "outcome" => "timeout").increment(1);
                warn!(session_id = %id, timeout_ms, "command timed out");
                Err(RuntimeError::Timeout {
                    session_id: id.clone(),
                    status: entry.status(),
                    timeout_ms,
                })
            }
        }
    }

    fn resolve_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.config.max_timeout),
            _ => self.config.default_timeout.min(self.config.max_timeout),
        }
    }

    fn record(
        &self,
        entry: &SessionEntry,
        command: &str,
        output: String,
        exit_code: i32,
        duration_ms: u64,
        timed_out: bool,
    ) {
        let execution = CommandExecution {
            command: command.to_owned(),
            output,
            exit_code,
            duration_ms,
            timestamp: self.now(),
            timed_out,
        };
        let cap = self.config.history_cap;
        entry.write(|s| s.push_history(execution, cap));
        self.emit(
            entry.id(),
            SessionEventKind::CommandExecuted {
                exit_code,
                timed_out,
            },
        );
    }

    /// Surface a sandbox failure; a lost environment fails the session.
    fn execution_failed(
        &self,
        entry: &Arc<SessionEntry>,
        error: SandboxError,
    ) -> RuntimeError {
        counter!("dojo_commands_total", "outcome" => "error").increment(1);
        if let SandboxError::EnvironmentLost { message, .. } = &error {
            let reason = format!("environment_lost: {message}");
            let _ = self.terminate(entry, SessionStatus::Failed, &reason);
        } else {
            warn!(session_id = %entry.id(), error = %error, "command dispatch failed");
        }
        RuntimeError::Execution {
            session_id: entry.id().clone(),
            status: entry.status(),
            message: error.to_string(),
        }
    }
}

pub(crate) fn ensure_active(entry: &SessionEntry) -> Result<(), RuntimeError> {
    if entry.status() == SessionStatus::Active {
        Ok(())
    } else {
        Err(invalid_state(entry))
    }
}

pub(crate) fn invalid_state(entry: &SessionEntry) -> RuntimeError {
    RuntimeError::InvalidState {
        session_id: entry.id().clone(),
        status: entry.status(),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Cut `output` to at most `max_bytes` on a char boundary, marking the cut.
pub fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_MARKER);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::{NewSession, SessionManagerConfig};
    use chrono::Utc;
    use dojo_core::environment::EnvironmentSpec;
    use dojo_core::ids::{StepId, UserId, WorkshopId};
    use dojo_core::workshop::{StepDefinition, SuccessCriterion};
    use dojo_sandbox::scripted::ScriptedProvisioner;
    use dojo_sandbox::{CommandOutput, Provisioner};

    fn request() -> NewSession {
        NewSession {
            workshop_id: WorkshopId::from("w"),
            user_id: UserId::from("u"),
            steps: vec![StepDefinition {
                id: StepId::from("a"),
                title: String::new(),
                points: 10,
                criterion: SuccessCriterion::ExitCode {
                    expected: 0,
                    command_pattern: None,
                },
                hint: None,
            }],
            ttl: Some(chrono::Duration::minutes(60)),
            environment: EnvironmentSpec::default(),
        }
    }

    async fn setup(
        p: ScriptedProvisioner,
        config: SessionManagerConfig,
    ) -> (Arc<ScriptedProvisioner>, Arc<ManualClock>, Arc<SessionManager>, SessionId) {
        let p = Arc::new(p);
        let clock = Arc::new(ManualClock::starting_now());
        let provisioner: Arc<dyn Provisioner> = p.clone();
        let mgr = Arc::new(SessionManager::new(provisioner, config).with_clock(clock.clone()));
        let id = mgr.create_session(request()).await.unwrap().session.id;
        (p, clock, mgr, id)
    }

    #[tokio::test]
    async fn execute_records_history() {
        let (_p, _clock, mgr, id) =
            setup(ScriptedProvisioner::echo(), SessionManagerConfig::default()).await;
        let res = mgr.execute(&id, "ls -la", None).await.unwrap();
        assert_eq!(res.output, "ls -la");
        assert_eq!(res.exit_code, 0);

        let snap = mgr.get_status(&id).await.unwrap();
        assert_eq!(snap.history.len(), 1);
        assert_eq!(snap.history[0].command, "ls -la");
        assert!(!snap.history[0].timed_out);
        assert!(!snap.command_in_flight);
        assert_eq!(snap.session.current_step_index, 0);
        assert_eq!(snap.session.total_score, 0);
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let (_p, _clock, mgr, id) =
            setup(ScriptedProvisioner::echo(), SessionManagerConfig::default()).await;
        let err = mgr.execute(&id, "   ", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_execute_is_busy() {
        let (_p, _clock, mgr, id) = setup(
            ScriptedProvisioner::echo().with_latency(Duration::from_secs(2)),
            SessionManagerConfig::default(),
        )
        .await;

        let first = {
            let mgr = Arc::clone(&mgr);
            let id = id.clone();
            tokio::spawn(async move { mgr.execute(&id, "sleep 2", None).await })
        };
        tokio::task::yield_now().await;
        assert!(mgr.get_status(&id).await.unwrap().command_in_flight);

        let err = mgr.execute(&id, "ls", None).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Busy {
                status: SessionStatus::Active,
                ..
            }
        ));

        assert!(first.await.unwrap().is_ok());
        assert!(mgr.execute(&id, "ls", None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_recorded_and_session_stays_active() {
        let (_p, _clock, mgr, id) = setup(
            ScriptedProvisioner::echo().with_latency(Duration::from_secs(60)),
            SessionManagerConfig::default(),
        )
        .await;

        let err = mgr
            .execute(&id, "sleep 60", Some(Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Timeout {
                timeout_ms: 500,
                status: SessionStatus::Active,
                ..
            }
        ));

        let snap = mgr.get_status(&id).await.unwrap();
        assert_eq!(snap.session.status, SessionStatus::Active);
        let last = snap.history.last().unwrap();
        assert_eq!(last.exit_code, TIMEOUT_EXIT_CODE);
        assert!(last.timed_out);
        assert!(!snap.command_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn late_partial_output_is_kept() {
        let (_p, _clock, mgr, id) = setup(
            ScriptedProvisioner::echo()
                .with_latency(Duration::from_secs(60))
                .with_timeout_reply(Duration::from_millis(20), Some("half of the build log")),
            SessionManagerConfig::default(),
        )
        .await;

        let err = mgr
            .execute(&id, "make", Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { timeout_ms: 1000, .. }));
        let last = mgr.get_status(&id).await.unwrap().history.pop().unwrap();
        assert_eq!(last.output, "half of the build log");
        assert!(last.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_provider_is_cut_off_after_grace() {
        let (_p, _clock, mgr, id) = setup(
            ScriptedProvisioner::echo()
                .with_latency(Duration::from_secs(60))
                .with_timeout_reply(Duration::from_secs(30), Some("never delivered")),
            SessionManagerConfig::default(),
        )
        .await;

        let err = mgr
            .execute(&id, "make", Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { timeout_ms: 1000, .. }));
        let last = mgr.get_status(&id).await.unwrap().history.pop().unwrap();
        assert_eq!(last.output, "");
        assert!(last.duration_ms >= 1000 + millis(TIMEOUT_GRACE));
    }

    #[tokio::test]
    async fn held_slot_reports_terminal_status_over_busy() {
        let (_p, _clock, mgr, id) =
            setup(ScriptedProvisioner::echo(), SessionManagerConfig::default()).await;
        let entry = mgr.lookup(&id).unwrap();
        let held = entry.exec_lock.try_lock().unwrap();

        assert!(matches!(
            claim_exec_slot(&entry),
            Err(RuntimeError::Busy { status: SessionStatus::Active, .. })
        ));

        let _ = entry.write(|s| s.session.finish(SessionStatus::Completed, "user_ended", Utc::now()));
        assert!(matches!(
            claim_exec_slot(&entry),
            Err(RuntimeError::InvalidState { status: SessionStatus::Completed, .. })
        ));
        drop(held);
        assert!(matches!(
            claim_exec_slot(&entry),
            Err(RuntimeError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn requested_timeout_is_clamped() {
        let config = SessionManagerConfig {
            max_timeout: Duration::from_secs(1),
            ..SessionManagerConfig::default()
        };
        let (_p, _clock, mgr, id) = setup(
            ScriptedProvisioner::echo().with_latency(Duration::from_secs(5)),
            config,
        )
        .await;
        let err = mgr
            .execute(&id, "sleep 5", Some(Duration::from_secs(3600)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { timeout_ms: 1000, .. }));
    }

    #[tokio::test]
    async fn environment_lost_fails_session() {
        let (p, _clock, mgr, id) =
            setup(ScriptedProvisioner::echo(), SessionManagerConfig::default()).await;
        // Tear the environment down behind the manager's back.
        let env_id = mgr.get_status(&id).await.unwrap().session.environment_id.unwrap();
        p.teardown(&env_id).await.unwrap();

        let err = mgr.execute(&id, "ls", None).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Execution {
                status: SessionStatus::Failed,
                ..
            }
        ));
        let snap = mgr.get_status(&id).await.unwrap();
        assert_eq!(snap.session.status, SessionStatus::Failed);
        assert!(
            snap.session
                .end_reason
                .unwrap()
                .starts_with("environment_lost:")
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let (_p, _clock, mgr, id) = setup(
            ScriptedProvisioner::new(|_| Ok(CommandOutput::new("nope", 2))),
            SessionManagerConfig::default(),
        )
        .await;
        let res = mgr.execute(&id, "grep x y", None).await.unwrap();
        assert_eq!(res.exit_code, 2);
    }

    #[tokio::test]
    async fn execute_after_expiry_is_invalid_state() {
        let (p, clock, mgr, id) =
            setup(ScriptedProvisioner::echo(), SessionManagerConfig::default()).await;
        clock.advance(chrono::Duration::minutes(61));
        let err = mgr.execute(&id, "ls", None).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::InvalidState {
                status: SessionStatus::Expired,
                ..
            }
        ));
        assert!(p.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ending_mid_command_defers_teardown() {
        let (p, _clock, mgr, id) = setup(
            ScriptedProvisioner::echo().with_latency(Duration::from_secs(2)),
            SessionManagerConfig::default(),
        )
        .await;

        let running = {
            let mgr = Arc::clone(&mgr);
            let id = id.clone();
            tokio::spawn(async move { mgr.execute(&id, "make build", None).await })
        };
        tokio::task::yield_now().await;

        let snap = mgr.end_session(&id, None).await.unwrap();
        assert_eq!(snap.session.status, SessionStatus::Completed);
        assert_eq!(p.teardown_calls(), 0);

        // The in-flight command is allowed to finish.
        assert!(running.await.unwrap().is_ok());
        let _ = mgr.shutdown().await;
        assert_eq!(p.teardown_calls(), 1);
        assert!(matches!(
            mgr.execute(&id, "ls", None).await,
            Err(RuntimeError::InvalidState { .. })
        ));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("short".into(), 10), "short");
        let out = truncate_output("ééé".into(), 3);
        assert_eq!(out, format!("é{TRUNCATION_MARKER}"));
        let out = truncate_output("abcdef".into(), 4);
        assert_eq!(out, format!("abcd{TRUNCATION_MARKER}"));
    }

    #[test]
    fn timeout_resolution() {
        let p: Arc<dyn Provisioner> = Arc::new(ScriptedProvisioner::echo());
        let config = SessionManagerConfig {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(60),
            ..SessionManagerConfig::default()
        };
        let mgr = SessionManager::new(p, config);
        assert_eq!(mgr.resolve_timeout(None), Duration::from_secs(30));
        assert_eq!(mgr.resolve_timeout(Some(Duration::ZERO)), Duration::from_secs(30));
        assert_eq!(
            mgr.resolve_timeout(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            mgr.resolve_timeout(Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
    }
}
