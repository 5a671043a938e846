//! Deterministic provisioner for tests.
//!
//! Commands are answered by a handler closure, optionally after a fixed
//! latency (use `tokio::time::pause` to make latency free). Every call is
//! counted so tests can assert on teardown behavior.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dojo_core::environment::{Environment, EnvironmentSpec};
use dojo_core::ids::EnvironmentId;
use parking_lot::Mutex;

use crate::errors::SandboxError;
use crate::traits::{CommandOutput, Provisioner};

type Handler = dyn Fn(&str) -> Result<CommandOutput, SandboxError> + Send + Sync;

/// Scripted provisioner with call accounting.
pub struct ScriptedProvisioner {
    handler: Arc<Handler>,
    latency: Mutex<Duration>,
    teardown_latency: Mutex<Duration>,
    timeout_reply: Mutex<(Duration, Option<String>)>,
    provision_error: Mutex<Option<String>>,
    fail_teardown: AtomicBool,
    provision_calls: AtomicUsize,
    teardown_calls: AtomicUsize,
    commands: Mutex<Vec<String>>,
    live: Mutex<HashSet<EnvironmentId>>,
}

impl ScriptedProvisioner {
    /// Answer every command with `handler`.
    pub fn new(
        handler: impl Fn(&str) -> Result<CommandOutput, SandboxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            latency: Mutex::new(Duration::ZERO),
            teardown_latency: Mutex::new(Duration::ZERO),
            timeout_reply: Mutex::new((Duration::ZERO, None)),
            provision_error: Mutex::new(None),
            fail_teardown: AtomicBool::new(false),
            provision_calls: AtomicUsize::new(0),
            teardown_calls: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Echo the command back with exit code 0.
    pub fn echo() -> Self {
        Self::new(|cmd| Ok(CommandOutput::new(cmd, 0)))
    }

    /// Delay every command by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change the per-command latency.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Delay every `teardown` by `latency`.
    #[must_use]
    pub fn with_teardown_latency(self, latency: Duration) -> Self {
        *self.teardown_latency.lock() = latency;
        self
    }

    /// Answer timed-out commands `overrun` past their deadline, carrying
    /// `partial` output, the way a remote sandbox reports a killed command.
    #[must_use]
    pub fn with_timeout_reply(self, overrun: Duration, partial: Option<&str>) -> Self {
        *self.timeout_reply.lock() = (overrun, partial.map(str::to_owned));
        self
    }

    /// Make every `provision` call fail with `message`.
    #[must_use]
    pub fn failing_provision(self, message: impl Into<String>) -> Self {
        *self.provision_error.lock() = Some(message.into());
        self
    }

    /// Make every `teardown` call fail (it is still counted).
    #[must_use]
    pub fn failing_teardown(self) -> Self {
        self.fail_teardown.store(true, Ordering::SeqCst);
        self
    }

    /// Number of `provision` calls.
    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    /// Number of `teardown` calls.
    pub fn teardown_calls(&self) -> usize {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Environments provisioned and not yet torn down.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn provision(&self, spec: &EnvironmentSpec) -> Result<Environment, SandboxError> {
        let _ = self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.provision_error.lock().clone();
        if let Some(message) = failure {
            return Err(SandboxError::Provision { message });
        }
        let id = EnvironmentId::new();
        let _ = self.live.lock().insert(id.clone());
        Ok(Environment::ready(id, spec.resources.clone()))
    }

    async fn run_command(
        &self,
        environment: &EnvironmentId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError> {
        self.commands.lock().push(command.to_owned());
        if !self.live.lock().contains(environment) {
            return Err(SandboxError::EnvironmentLost {
                environment_id: environment.clone(),
                message: "environment was torn down".into(),
            });
        }
        let latency = *self.latency.lock();
        if latency > timeout {
            let (overrun, partial_output) = self.timeout_reply.lock().clone();
            tokio::time::sleep(timeout + overrun).await;
            return Err(SandboxError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                partial_output,
            });
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        (self.handler)(command)
    }

    async fn teardown(&self, environment: &EnvironmentId) -> Result<(), SandboxError> {
        let _ = self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.teardown_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let _ = self.live.lock().remove(environment);
        if self.fail_teardown.load(Ordering::SeqCst) {
            return Err(SandboxError::Teardown {
                environment_id: environment.clone(),
                message: "scripted teardown failure".into(),
            });
        }
        Ok(())
    }
}
