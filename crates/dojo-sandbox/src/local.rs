//! Local development provisioner.
//!
//! Each environment is a directory under a root path; commands run through
//! `bash -c` with that directory as the working directory. There is no
//! isolation, so this backend is only for running the engine on a laptop.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dojo_core::environment::{Environment, EnvironmentSpec};
use dojo_core::ids::EnvironmentId;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::SandboxError;
use crate::traits::{CommandOutput, Provisioner};

#[derive(Clone)]
struct LocalEnvironment {
    dir: PathBuf,
    env: BTreeMap<String, String>,
}

/// Provisioner backed by local directories and subprocesses.
pub struct LocalProvisioner {
    root: PathBuf,
    environments: Mutex<HashMap<EnvironmentId, LocalEnvironment>>,
}

impl LocalProvisioner {
    /// Create a provisioner that places environments under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            environments: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live environments.
    pub fn live_count(&self) -> usize {
        self.environments.lock().len()
    }

    fn lookup(&self, id: &EnvironmentId) -> Result<LocalEnvironment, SandboxError> {
        self.environments
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::EnvironmentLost {
                environment_id: id.clone(),
                message: "no such local environment".into(),
            })
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(&self, spec: &EnvironmentSpec) -> Result<Environment, SandboxError> {
        let id = EnvironmentId::new();
        let dir = self.root.join(id.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::Provision {
                message: format!("failed to create {}: {e}", dir.display()),
            })?;

        let _ = self.environments.lock().insert(
            id.clone(),
            LocalEnvironment {
                dir: dir.clone(),
                env: spec.env.clone(),
            },
        );
        debug!(environment_id = %id, dir = %dir.display(), "local environment created");

        Ok(Environment::ready(id, spec.resources.clone())
            .with_endpoint("workdir", dir.display().to_string()))
    }

    async fn run_command(
        &self,
        environment: &EnvironmentId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError> {
        let local = self.lookup(environment)?;

        let mut cmd = tokio::process::Command::new("bash");
        let _ = cmd
            .arg("-c")
            .arg(command)
            .current_dir(&local.dir)
            .envs(&local.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| SandboxError::Execution {
            message: format!("failed to spawn process: {e}"),
        })?;

        // Dropping the future on timeout drops the child, which kills it.
        let Ok(result) = tokio::time::timeout(timeout, child.wait_with_output()).await else {
            warn!(environment_id = %environment, command, "local command timed out");
            return Err(SandboxError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                partial_output: None,
            });
        };
        let output = result.map_err(|e| SandboxError::Execution {
            message: format!("process wait failed: {e}"),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput::new(combined, output.status.code().unwrap_or(-1)))
    }

    async fn teardown(&self, environment: &EnvironmentId) -> Result<(), SandboxError> {
        let removed = self.environments.lock().remove(environment);
        let Some(local) = removed else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(&local.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Teardown {
                environment_id: environment.clone(),
                message: e.to_string(),
            }),
        }
    }
}
