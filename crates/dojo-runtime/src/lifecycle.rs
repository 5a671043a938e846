//! Session lifecycle manager.
//!
//! Owns the session state machine:
//!
//! ```text
//! starting ──provisioned──▶ active ──all steps / user end──▶ completed
//!     │                       │
//!     │                       ├──now >= expiresAt──▶ expired
//!     └──provision failed─────┴──environment lost──▶ failed
//! ```
//!
//! Terminal statuses are final. Entering one tears the environment down
//! exactly once, on a background task that first waits for any in-flight
//! command to return, so a slow provider never holds up other sessions.
//! Expiry is enforced both by [`SessionManager::sweep`] and at the top of
//! every per-session operation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dojo_core::environment::{Environment, EnvironmentSpec, EnvironmentStatus};
use dojo_core::events::{SessionEvent, SessionEventKind};
use dojo_core::ids::{EnvironmentId, SessionId, UserId, WorkshopId};
use dojo_core::session::{Session, SessionSnapshot, SessionStatus};
use dojo_core::workshop::{StepDefinition, Workshop};
use dojo_sandbox::{Provisioner, SandboxError};
use dojo_settings::DojoSettings;
use metrics::{counter, gauge};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::RuntimeError;
use crate::scoring::{DecayScoring, ScoringPolicy};
use crate::store::{SessionEntry, SessionStore};
use crate::validation::ValidatorRegistry;

/// End reason recorded when the TTL elapses.
pub const REASON_TTL_ELAPSED: &str = "ttl_elapsed";
/// End reason recorded when every step has been validated.
pub const REASON_ALL_STEPS_COMPLETED: &str = "all_steps_completed";
/// End reason recorded when the user ends a session without giving one.
pub const REASON_USER_ENDED: &str = "user_ended";
/// End reason recorded for sessions ended by server shutdown.
pub const REASON_SHUTDOWN: &str = "server_shutdown";

/// Tunables for the lifecycle manager.
#[derive(Clone, Debug)]
pub struct SessionManagerConfig {
    /// TTL used when a request does not carry one.
    pub default_ttl: chrono::Duration,
    /// How long terminal sessions stay queryable.
    pub retention: chrono::Duration,
    /// Maximum number of non-terminal sessions.
    pub max_live_sessions: usize,
    /// Command timeout used when none is requested.
    pub default_timeout: Duration,
    /// Upper bound on requested command timeouts.
    pub max_timeout: Duration,
    /// Executions kept per session.
    pub history_cap: usize,
    /// Recorded output is truncated past this many bytes.
    pub max_output_bytes: usize,
    /// Broadcast channel capacity for session events.
    pub event_capacity: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self::from_settings(&DojoSettings::default())
    }
}

impl SessionManagerConfig {
    /// Derive the runtime configuration from loaded settings.
    pub fn from_settings(settings: &DojoSettings) -> Self {
        let secs = |s: u64| chrono::Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1000));
        Self {
            default_ttl: secs(settings.session.default_ttl_secs),
            retention: secs(settings.session.retention_secs),
            max_live_sessions: settings.server.max_concurrent_sessions,
            default_timeout: Duration::from_millis(settings.execution.default_timeout_ms),
            max_timeout: Duration::from_millis(settings.execution.max_timeout_ms),
            history_cap: settings.execution.history_cap,
            max_output_bytes: settings.execution.max_output_bytes,
            event_capacity: 256,
        }
    }
}

/// Parameters for [`SessionManager::create_session`].
#[derive(Clone, Debug)]
pub struct NewSession {
    /// Workshop being attempted.
    pub workshop_id: WorkshopId,
    /// User attempting it.
    pub user_id: UserId,
    /// Ordered step definitions; fixes the progress length.
    pub steps: Vec<StepDefinition>,
    /// Session TTL; the configured default applies when `None`.
    pub ttl: Option<chrono::Duration>,
    /// Sandbox template.
    pub environment: EnvironmentSpec,
}

impl NewSession {
    /// Request a session for `workshop` on behalf of `user_id`.
    pub fn for_workshop(workshop: &Workshop, user_id: UserId) -> Self {
        Self {
            workshop_id: workshop.id.clone(),
            user_id,
            steps: workshop.steps.clone(),
            ttl: workshop
                .ttl_secs
                .and_then(|s| i64::try_from(s).ok())
                .map(chrono::Duration::seconds),
            environment: workshop.environment.clone(),
        }
    }
}

/// Counts from one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions moved to `expired`.
    pub expired: usize,
    /// Terminal sessions removed after retention.
    pub reaped: usize,
}

/// Lifecycle manager: the only writer of session state.
pub struct SessionManager {
    pub(crate) store: SessionStore,
    pub(crate) provisioner: Arc<dyn Provisioner>,
    pub(crate) validators: ValidatorRegistry,
    pub(crate) scoring: Arc<dyn ScoringPolicy>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: SessionManagerConfig,
    events: broadcast::Sender<SessionEvent>,
    create_lock: parking_lot::Mutex<()>,
    teardowns: TaskTracker,
}

impl SessionManager {
    /// Manager with the system clock, default decay scoring and built-in validators.
    pub fn new(provisioner: Arc<dyn Provisioner>, config: SessionManagerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store: SessionStore::new(),
            provisioner,
            validators: ValidatorRegistry::with_builtins(),
            scoring: Arc::new(DecayScoring::default()),
            clock: Arc::new(SystemClock),
            config,
            events,
            create_lock: parking_lot::Mutex::new(()),
            teardowns: TaskTracker::new(),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the scoring policy.
    #[must_use]
    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringPolicy>) -> Self {
        self.scoring = scoring;
        self
    }

    /// Replace the validator registry.
    #[must_use]
    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Name of the provisioner backend.
    pub fn provisioner_name(&self) -> &str {
        self.provisioner.name()
    }

    /// Subscribe to lifecycle events for all sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Number of non-terminal sessions.
    pub fn live_count(&self) -> usize {
        self.store.live_count()
    }

    /// Number of stored sessions, terminal ones included.
    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    // ── Creation ────────────────────────────────────────────────────────

    /// Create a session and provision its environment.
    ///
    /// Returns once the session is `active`. A provisioning failure leaves the
    /// session `failed` (still queryable until reaped) and is not retried.
    #[instrument(skip(self, request), fields(workshop_id = %request.workshop_id, user_id = %request.user_id))]
    pub async fn create_session(&self, request: NewSession) -> Result<SessionSnapshot, RuntimeError> {
        let entry = self.register(request, false)?.1;
        self.provision(&entry).await
    }

    /// Return the caller's live session for this workshop, or create one.
    ///
    /// The boolean is `true` when a new session was created.
    #[instrument(skip(self, request), fields(workshop_id = %request.workshop_id, user_id = %request.user_id))]
    pub async fn create_or_resume(
        &self,
        request: NewSession,
    ) -> Result<(SessionSnapshot, bool), RuntimeError> {
        let (created, entry) = self.register(request, true)?;
        if !created {
            debug!(session_id = %entry.id(), "resuming live session");
            let _ = self.enforce_expiry(&entry);
            return Ok((entry.snapshot(), false));
        }
        Ok((self.provision(&entry).await?, true))
    }

    /// Validate the request and insert a `starting` session under the
    /// capacity check.
    fn register(
        &self,
        request: NewSession,
        reuse_live: bool,
    ) -> Result<(bool, Arc<SessionEntry>), RuntimeError> {
        if request.steps.is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "a session needs at least one step".into(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = request.steps.iter().find(|s| !seen.insert(&s.id)) {
            return Err(RuntimeError::InvalidRequest(format!(
                "duplicate step id {}",
                dup.id
            )));
        }
        let ttl = request.ttl.unwrap_or(self.config.default_ttl);
        if ttl <= chrono::Duration::zero() {
            return Err(RuntimeError::InvalidRequest("ttl must be positive".into()));
        }

        let guard = self.create_lock.lock();
        if reuse_live {
            if let Some(existing) = self.store.find_live(&request.user_id, &request.workshop_id) {
                return Ok((false, existing));
            }
        }
        let limit = self.config.max_live_sessions;
        if self.store.live_count() >= limit {
            warn!(limit, "session capacity reached");
            return Err(RuntimeError::CapacityExceeded { limit });
        }

        let now = self.clock.now();
        let session = Session::starting(
            SessionId::new(),
            request.workshop_id,
            request.user_id,
            request.steps.iter().map(|s| s.id.clone()),
            now,
            ttl,
        );
        let id = session.id.clone();
        let entry = Arc::new(SessionEntry::new(session, request.steps, request.environment));
        self.store.insert(Arc::clone(&entry));
        drop(guard);

        counter!("dojo_sessions_created_total").increment(1);
        self.record_live_gauge();
        self.emit(&id, SessionEventKind::Created);
        info!(session_id = %id, "session created");
        Ok((true, entry))
    }

    async fn provision(&self, entry: &Arc<SessionEntry>) -> Result<SessionSnapshot, RuntimeError> {
        let id = entry.id().clone();
        let mut spec = entry.environment_spec().clone();
        let _ = spec.labels.insert("dojo.session_id".into(), id.to_string());
        let _ = spec
            .labels
            .insert("dojo.workshop_id".into(), entry.workshop_id().to_string());
        let _ = spec
            .labels
            .insert("dojo.user_id".into(), entry.user_id().to_string());

        match self.provisioner.provision(&spec).await {
            Ok(environment) => {
                let env_id = environment.id.clone();
                let activated = entry.write(|s| {
                    let activated = s.session.activate(env_id.clone());
                    if !activated {
                        // Ended while provisioning; keep the reference so it is torn down.
                        s.session.environment_id = Some(env_id.clone());
                    }
                    s.environment = Some(environment);
                    activated
                });
                if activated {
                    info!(session_id = %id, environment_id = %env_id, "session active");
                    self.emit(&id, SessionEventKind::Activated);
                } else {
                    debug!(session_id = %id, "session ended during provisioning");
                    self.release_environment(entry);
                }
                let _ = self.enforce_expiry(entry);
                Ok(entry.snapshot())
            }
            Err(e) => {
                let message = match e {
                    SandboxError::Provision { message } => message,
                    other => other.to_string(),
                };
                warn!(session_id = %id, error = %message, "provisioning failed");
                counter!("dojo_provision_failures_total").increment(1);
                let reason = format!("provisioning_failed: {message}");
                let _ = self.terminate(entry, SessionStatus::Failed, &reason);
                Err(RuntimeError::Provision {
                    session_id: id,
                    message,
                })
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Current session and environment snapshot.
    pub async fn get_status(&self, id: &SessionId) -> Result<SessionSnapshot, RuntimeError> {
        let entry = self.lookup(id)?;
        let _ = self.enforce_expiry(&entry);
        Ok(entry.snapshot())
    }

    /// The caller's non-terminal session for a workshop, if any.
    pub async fn live_session_for(
        &self,
        user_id: &UserId,
        workshop_id: &WorkshopId,
    ) -> Option<SessionSnapshot> {
        let entry = self.store.find_live(user_id, workshop_id)?;
        if self.enforce_expiry(&entry) {
            return None;
        }
        Some(entry.snapshot())
    }

    // ── Termination ─────────────────────────────────────────────────────

    /// End a session on the user's behalf.
    ///
    /// Ending an already-terminal session returns its final snapshot. When no
    /// command is in flight the call waits for this session's teardown, so
    /// the snapshot shows the environment gone; otherwise it returns at once
    /// and the teardown follows the command.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn end_session(
        &self,
        id: &SessionId,
        reason: Option<&str>,
    ) -> Result<SessionSnapshot, RuntimeError> {
        let entry = self.lookup(id)?;
        let _ = self.enforce_expiry(&entry);
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(REASON_USER_ENDED);
        let _ = self.terminate(&entry, SessionStatus::Completed, reason);
        if entry.read(|s| s.session.environment_id.is_some()) && !entry.command_in_flight() {
            entry.released().await;
        }
        Ok(entry.snapshot())
    }

    /// Wait until the session's environment has been torn down.
    ///
    /// Returns at once for sessions that never received an environment.
    pub async fn environment_released(&self, id: &SessionId) -> Result<(), RuntimeError> {
        let entry = self.lookup(id)?;
        if entry.read(|s| s.session.environment_id.is_some()) {
            entry.released().await;
        }
        Ok(())
    }

    /// Expire due sessions and reap terminal ones past retention.
    ///
    /// Never waits on the provider; teardowns of expired sessions run on
    /// the background tracker.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for entry in self.store.entries() {
            if self.enforce_expiry(&entry) {
                report.expired += 1;
            }
        }

        let now = self.clock.now();
        for entry in self.store.entries() {
            let due = entry
                .ended_at()
                .is_some_and(|ended| ended + self.config.retention <= now);
            if due && self.store.remove(entry.id()).is_some() {
                debug!(session_id = %entry.id(), "session reaped");
                self.emit(entry.id(), SessionEventKind::Reaped);
                counter!("dojo_sessions_reaped_total").increment(1);
                report.reaped += 1;
            }
        }
        if report != SweepReport::default() {
            debug!(expired = report.expired, reaped = report.reaped, "sweep finished");
        }
        self.record_live_gauge();
        report
    }

    /// End every live session and wait for pending teardowns.
    pub async fn shutdown(&self) -> usize {
        let mut ended = 0;
        for entry in self.store.entries() {
            if self.terminate(&entry, SessionStatus::Completed, REASON_SHUTDOWN) {
                ended += 1;
            }
        }
        let _ = self.teardowns.close();
        self.teardowns.wait().await;
        info!(ended, "all sessions ended");
        ended
    }

    // ── Internals ───────────────────────────────────────────────────────

    pub(crate) fn lookup(&self, id: &SessionId) -> Result<Arc<SessionEntry>, RuntimeError> {
        self.store.get(id).ok_or_else(|| RuntimeError::NotFound {
            session_id: id.clone(),
        })
    }

    /// Move the session to `expired` if its TTL has elapsed.
    pub(crate) fn enforce_expiry(&self, entry: &Arc<SessionEntry>) -> bool {
        let now = self.clock.now();
        let expired = entry.write(|s| {
            s.session.is_due_for_expiry(now)
                && s.session
                    .finish(SessionStatus::Expired, REASON_TTL_ELAPSED, now)
        });
        if expired {
            self.after_terminal(entry, SessionStatus::Expired, REASON_TTL_ELAPSED);
        }
        expired
    }

    /// Enter a terminal status. Returns `false` if the session was already terminal.
    pub(crate) fn terminate(
        &self,
        entry: &Arc<SessionEntry>,
        status: SessionStatus,
        reason: &str,
    ) -> bool {
        let now = self.clock.now();
        let changed = entry.write(|s| s.session.finish(status, reason, now));
        if changed {
            self.after_terminal(entry, status, reason);
        }
        changed
    }

    /// Bookkeeping once a terminal status has been committed.
    pub(crate) fn after_terminal(
        &self,
        entry: &Arc<SessionEntry>,
        status: SessionStatus,
        reason: &str,
    ) {
        match status {
            SessionStatus::Completed => info!(session_id = %entry.id(), reason, "session completed"),
            _ => warn!(session_id = %entry.id(), %status, reason, "session ended"),
        }
        counter!("dojo_sessions_ended_total", "status" => status.as_str()).increment(1);
        self.record_live_gauge();
        self.emit(
            entry.id(),
            SessionEventKind::Terminated {
                status,
                reason: reason.to_owned(),
            },
        );
        self.release_environment(entry);
    }

    /// Tear the environment down exactly once, on the teardown tracker.
    ///
    /// The task takes the execution lock first, so a command or probe still
    /// running in the environment returns before the environment goes away.
    fn release_environment(&self, entry: &Arc<SessionEntry>) {
        let Some(env_id) = entry.read(|s| s.session.environment_id.clone()) else {
            return;
        };
        if !entry.claim_teardown() {
            return;
        }
        entry.write(|s| set_environment_status(s.environment.as_mut(), EnvironmentStatus::Terminating));
        if entry.command_in_flight() {
            debug!(session_id = %entry.id(), "teardown deferred until in-flight command returns");
        }

        let provisioner = Arc::clone(&self.provisioner);
        let entry = Arc::clone(entry);
        let exec_lock = Arc::clone(&entry.exec_lock);
        let _ = self.teardowns.spawn(async move {
            let _guard = exec_lock.lock_owned().await;
            teardown(provisioner.as_ref(), &entry, &env_id).await;
        });
    }

    pub(crate) fn emit(&self, id: &SessionId, kind: SessionEventKind) {
        let _ = self
            .events
            .send(SessionEvent::new(id.clone(), self.clock.now(), kind));
    }

    fn record_live_gauge(&self) {
        #[allow(clippy::cast_precision_loss)]
        gauge!("dojo_sessions_live").set(self.store.live_count() as f64);
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn set_environment_status(environment: Option<&mut Environment>, status: EnvironmentStatus) {
    if let Some(env) = environment {
        env.status = status;
    }
}

async fn teardown(provisioner: &dyn Provisioner, entry: &SessionEntry, env_id: &EnvironmentId) {
    match provisioner.teardown(env_id).await {
        Ok(()) => debug!(session_id = %entry.id(), environment_id = %env_id, "environment torn down"),
        Err(e) => {
            counter!("dojo_teardown_failures_total").increment(1);
            warn!(
                session_id = %entry.id(),
                environment_id = %env_id,
                error = %e,
                "teardown failed"
            );
        }
    }
    entry.write(|s| set_environment_status(s.environment.as_mut(), EnvironmentStatus::Terminated));
    entry.mark_released();
}
