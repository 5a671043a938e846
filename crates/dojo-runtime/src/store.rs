//! In-memory session store.
//!
//! The store maps session ids to [`SessionEntry`] handles. Each entry owns its
//! own locks, so operations on different sessions never contend:
//!
//! - `state`: `parking_lot::RwLock` over the session record, environment and
//!   history. Never held across an `.await`, so readers always see the last
//!   committed snapshot.
//! - `exec_lock`: async mutex held for the duration of a command; `try_lock`
//!   failure is what makes a second command `Busy`.
//! - `validate_lock`: serializes validation calls so attempts are counted once.
//! - `released`: flips to `true` once the environment teardown has returned.
//!
//! Mutating accessors are crate-private; outside code only gets snapshots.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use dojo_core::environment::{Environment, EnvironmentSpec};
use dojo_core::ids::{SessionId, UserId, WorkshopId};
use dojo_core::session::{CommandExecution, Session, SessionSnapshot, SessionStatus};
use dojo_core::workshop::StepDefinition;
use parking_lot::RwLock;

/// Mutable part of a session entry.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) session: Session,
    pub(crate) environment: Option<Environment>,
    pub(crate) history: VecDeque<CommandExecution>,
}

impl SessionState {
    /// Append an execution, evicting the oldest beyond `cap`.
    pub(crate) fn push_history(&mut self, execution: CommandExecution, cap: usize) {
        self.history.push_back(execution);
        while self.history.len() > cap.max(1) {
            let _ = self.history.pop_front();
        }
    }
}

/// One session and its concurrency controls.
pub struct SessionEntry {
    id: SessionId,
    user_id: UserId,
    workshop_id: WorkshopId,
    steps: Vec<StepDefinition>,
    environment_spec: EnvironmentSpec,
    state: RwLock<SessionState>,
    pub(crate) exec_lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) validate_lock: tokio::sync::Mutex<()>,
    in_flight: AtomicBool,
    teardown_claimed: AtomicBool,
    released: watch::Sender<bool>,
}

impl SessionEntry {
    pub(crate) fn new(
        session: Session,
        steps: Vec<StepDefinition>,
        environment_spec: EnvironmentSpec,
    ) -> Self {
        Self {
            id: session.id.clone(),
            user_id: session.user_id.clone(),
            workshop_id: session.workshop_id.clone(),
            steps,
            environment_spec,
            state: RwLock::new(SessionState {
                session,
                environment: None,
                history: VecDeque::new(),
            }),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
            validate_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicBool::new(false),
            teardown_claimed: AtomicBool::new(false),
            released: watch::Sender::new(false),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Workshop being attempted.
    pub fn workshop_id(&self) -> &WorkshopId {
        &self.workshop_id
    }

    /// Step definitions captured at creation.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Environment template captured at creation.
    pub fn environment_spec(&self) -> &EnvironmentSpec {
        &self.environment_spec
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.state.read().session.status
    }

    /// When the session entered a terminal status.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().session.ended_at
    }

    /// Whether a command is currently running.
    pub fn command_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Latest committed view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        SessionSnapshot {
            session: state.session.clone(),
            environment: state.environment.clone(),
            command_in_flight: self.command_in_flight(),
            history: state.history.iter().cloned().collect(),
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.state.read())
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub(crate) fn set_in_flight(&self, value: bool) {
        self.in_flight.store(value, Ordering::SeqCst);
    }

    /// Returns `true` exactly once per entry.
    pub(crate) fn claim_teardown(&self) -> bool {
        !self.teardown_claimed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_released(&self) {
        let _ = self.released.send_replace(true);
    }

    /// Resolves once the environment teardown has returned, whether or not
    /// it succeeded.
    pub async fn released(&self) {
        let mut rx = self.released.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// Concurrent map of live and recently ended sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, entry: Arc<SessionEntry>) {
        let _ = self.sessions.insert(entry.id().clone(), entry);
    }

    /// Look up a session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    pub(crate) fn remove(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(id).map(|(_, e)| e)
    }

    /// All entries, in no particular order.
    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Total entries, terminal ones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Entries not yet in a terminal status.
    pub fn live_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| !e.value().status().is_terminal())
            .count()
    }

    /// The non-terminal session for `(user, workshop)`, if any.
    pub fn find_live(&self, user_id: &UserId, workshop_id: &WorkshopId) -> Option<Arc<SessionEntry>> {
        self.sessions
            .iter()
            .find(|e| {
                let entry = e.value();
                entry.user_id() == user_id
                    && entry.workshop_id() == workshop_id
                    && !entry.status().is_terminal()
            })
            .map(|e| Arc::clone(e.value()))
    }
}
