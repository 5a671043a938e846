//! Provisioner contract.

use std::time::Duration;

use async_trait::async_trait;
use dojo_core::environment::{Environment, EnvironmentSpec};
use dojo_core::ids::EnvironmentId;
use serde::{Deserialize, Serialize};

use crate::errors::SandboxError;

/// Result of a command that ran to completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    /// Combined output.
    pub output: String,
    /// Process exit code.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Build an output record.
    pub fn new(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            exit_code,
        }
    }
}

/// External sandbox provider.
///
/// Implementations may take up to the full `timeout` in `run_command` and
/// give no ordering guarantees across environments.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Create an environment. Returns once it is ready to run commands.
    async fn provision(&self, spec: &EnvironmentSpec) -> Result<Environment, SandboxError>;

    /// Run `command` in the environment, waiting at most `timeout`.
    async fn run_command(
        &self,
        environment: &EnvironmentId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError>;

    /// Destroy the environment. Best-effort.
    async fn teardown(&self, environment: &EnvironmentId) -> Result<(), SandboxError>;
}
