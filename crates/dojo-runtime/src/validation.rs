//! Step criterion evaluation.
//!
//! Each [`SuccessCriterion`] kind is handled by a [`StepValidator`] looked up
//! by name in a [`ValidatorRegistry`]. Built-in validators cover exit codes,
//! output matching and live probes; `delegated` criteria resolve to whatever
//! external validator was registered under their name.
//!
//! Validators only ever see executions that have already been recorded, so a
//! command still in flight can never be observed half-finished. Timed-out
//! executions are recorded but never count as the relevant one: their exit
//! code is synthetic and their output partial.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dojo_core::ids::{EnvironmentId, SessionId};
use dojo_core::session::CommandExecution;
use dojo_core::workshop::{StepDefinition, SuccessCriterion};
use dojo_sandbox::{Provisioner, SandboxError};
use regex::Regex;
use tracing::debug;

use crate::execution::TIMEOUT_GRACE;

/// Feedback used when an output criterion has nothing to look at.
pub const NO_OUTPUT_FEEDBACK: &str = "no command output to check yet";

/// Outcome of evaluating one criterion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the criterion is satisfied.
    pub valid: bool,
    /// Human-readable explanation.
    pub feedback: String,
}

impl Verdict {
    /// A satisfied criterion.
    pub fn pass(feedback: impl Into<String>) -> Self {
        Self {
            valid: true,
            feedback: feedback.into(),
        }
    }

    /// An unsatisfied criterion.
    pub fn fail(feedback: impl Into<String>) -> Self {
        Self {
            valid: false,
            feedback: feedback.into(),
        }
    }
}

/// Errors that prevent a criterion from being evaluated at all.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// A regex in the step definition does not compile.
    #[error("invalid pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        message: String,
    },

    /// No validator is registered under the criterion's name.
    #[error("no validator registered for {0:?}")]
    UnknownValidator(String),

    /// A validator was handed a criterion kind it does not understand.
    #[error("validator {validator} cannot evaluate {criterion} criteria")]
    Mismatch {
        /// Validator that was called.
        validator: String,
        /// Criterion kind it received.
        criterion: String,
    },

    /// The check needs a live environment and the session has none.
    #[error("session has no environment to check")]
    NoEnvironment,

    /// The sandbox failed while running a check.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// An external validator failed.
    #[error("{0}")]
    Failed(String),
}

/// Everything a validator may inspect.
pub struct ValidationContext<'a> {
    /// Session being validated.
    pub session_id: &'a SessionId,
    /// Step under validation.
    pub step: &'a StepDefinition,
    /// Recorded executions, oldest first.
    pub history: &'a [CommandExecution],
    /// Live environment, if the session has one.
    pub environment_id: Option<&'a EnvironmentId>,
    /// Provisioner for checks that run commands. Only criteria reporting
    /// [`SuccessCriterion::runs_in_environment`] hold the session's command
    /// slot while evaluating, so only those may use it.
    pub provisioner: &'a dyn Provisioner,
    /// Timeout for probe commands.
    pub probe_timeout: Duration,
}

impl ValidationContext<'_> {
    /// Most recent completed execution whose command matches
    /// `command_pattern`, or the most recent completed execution when no
    /// pattern is given.
    pub fn relevant_execution(
        &self,
        command_pattern: Option<&str>,
    ) -> Result<Option<&CommandExecution>, ValidationError> {
        let re = command_pattern.map(compile).transpose()?;
        Ok(self
            .history
            .iter()
            .rev()
            .filter(|e| !e.timed_out)
            .find(|e| re.as_ref().is_none_or(|re| re.is_match(&e.command))))
    }

    fn environment(&self) -> Result<&EnvironmentId, ValidationError> {
        self.environment_id.ok_or(ValidationError::NoEnvironment)
    }
}

/// Evaluates one kind of success criterion.
#[async_trait]
pub trait StepValidator: Send + Sync {
    /// Registry key; matches [`SuccessCriterion::kind`].
    fn name(&self) -> &str;

    /// Decide whether `criterion` holds.
    async fn evaluate(
        &self,
        criterion: &SuccessCriterion,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, ValidationError>;
}

/// Name-keyed set of validators.
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn StepValidator>>,
}

impl ValidatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// Registry with every built-in validator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExitCodeValidator));
        registry.register(Arc::new(OutputEqualsValidator));
        registry.register(Arc::new(OutputContainsValidator));
        registry.register(Arc::new(OutputMatchesValidator));
        registry.register(Arc::new(ProbeValidator));
        registry
    }

    /// Register a validator. Overwrites any existing one with the same name.
    pub fn register(&mut self, validator: Arc<dyn StepValidator>) {
        debug!(validator = validator.name(), "step validator registered");
        let _ = self
            .validators
            .insert(validator.name().to_owned(), validator);
    }

    /// Look up a validator by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepValidator>> {
        self.validators.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.validators.keys().cloned().collect();
        names.sort();
        names
    }

    /// Evaluate the step's criterion. Failure feedback carries the step hint.
    pub async fn evaluate(&self, ctx: &ValidationContext<'_>) -> Result<Verdict, ValidationError> {
        let criterion = &ctx.step.criterion;
        let validator = self
            .get(criterion.kind())
            .ok_or_else(|| ValidationError::UnknownValidator(criterion.kind().to_owned()))?;

        let mut verdict = validator.evaluate(criterion, ctx).await?;
        if !verdict.valid {
            if let Some(hint) = &ctx.step.hint {
                verdict.feedback = format!("{} (hint: {hint})", verdict.feedback);
            }
        }
        Ok(verdict)
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn compile(pattern: &str) -> Result<Regex, ValidationError> {
    Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
        pattern: pattern.to_owned(),
        message: e.to_string(),
    })
}

fn mismatch(validator: &str, criterion: &SuccessCriterion) -> ValidationError {
    ValidationError::Mismatch {
        validator: validator.to_owned(),
        criterion: criterion.kind().to_owned(),
    }
}

fn excerpt(output: &str) -> String {
    const MAX: usize = 120;
    let trimmed = output.trim();
    if trimmed.len() <= MAX {
        return trimmed.to_owned();
    }
    let mut cut = MAX;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}

/// `exitCode` criteria.
pub struct ExitCodeValidator;

#[async_trait]
impl StepValidator for ExitCodeValidator {
    fn name(&self) -> &str {
        "exitCode"
    }

    async fn evaluate(
        &self,
        criterion: &SuccessCriterion,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, ValidationError> {
        let SuccessCriterion::ExitCode {
            expected,
            command_pattern,
        } = criterion
        else {
            return Err(mismatch(self.name(), criterion));
        };
        let Some(exec) = ctx.relevant_execution(command_pattern.as_deref())? else {
            return Ok(Verdict::fail(NO_OUTPUT_FEEDBACK));
        };
        if exec.exit_code == *expected {
            Ok(Verdict::pass(format!("`{}` exited with {expected}", exec.command)))
        } else {
            Ok(Verdict::fail(format!(
                "expected exit code {expected}, but `{}` exited with {}",
                exec.command, exec.exit_code
            )))
        }
    }
}

/// `outputEquals` criteria.
pub struct OutputEqualsValidator;

#[async_trait]
impl StepValidator for OutputEqualsValidator {
    fn name(&self) -> &str {
        "outputEquals"
    }

    async fn evaluate(
        &self,
        criterion: &SuccessCriterion,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, ValidationError> {
        let SuccessCriterion::OutputEquals {
            expected,
            trim,
            command_pattern,
        } = criterion
        else {
            return Err(mismatch(self.name(), criterion));
        };
        let Some(exec) = ctx.relevant_execution(command_pattern.as_deref())? else {
            return Ok(Verdict::fail(NO_OUTPUT_FEEDBACK));
        };
        let matches = if *trim {
            exec.output.trim() == expected.trim()
        } else {
            exec.output == *expected
        };
        if matches {
            Ok(Verdict::pass("output matches the expected value"))
        } else {
            Ok(Verdict::fail(format!(
                "expected output {:?}, got {:?}",
                excerpt(expected),
                excerpt(&exec.output)
            )))
        }
    }
}

/// `outputContains` criteria.
pub struct OutputContainsValidator;

#[async_trait]
impl StepValidator for OutputContainsValidator {
    fn name(&self) -> &str {
        "outputContains"
    }

    async fn evaluate(
        &self,
        criterion: &SuccessCriterion,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, ValidationError> {
        let SuccessCriterion::OutputContains {
            needle,
            command_pattern,
        } = criterion
        else {
            return Err(mismatch(self.name(), criterion));
        };
        let Some(exec) = ctx.relevant_execution(command_pattern.as_deref())? else {
            return Ok(Verdict::fail(NO_OUTPUT_FEEDBACK));
        };
        if exec.output.contains(needle.as_str()) {
            Ok(Verdict::pass(format!("output contains {needle:?}")))
        } else {
            Ok(Verdict::fail(format!(
                "output of `{}` does not contain {needle:?}",
                exec.command
            )))
        }
    }
}

/// `outputMatches` criteria.
pub struct OutputMatchesValidator;

#[async_trait]
impl StepValidator for OutputMatchesValidator {
    fn name(&self) -> &str {
        "outputMatches"
    }

    async fn evaluate(
        &self,
        criterion: &SuccessCriterion,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, ValidationError> {
        let SuccessCriterion::OutputMatches {
            pattern,
            command_pattern,
        } = criterion
        else {
            return Err(mismatch(self.name(), criterion));
        };
        let re = compile(pattern)?;
        let Some(exec) = ctx.relevant_execution(command_pattern.as_deref())? else {
            return Ok(Verdict::fail(NO_OUTPUT_FEEDBACK));
        };
        if re.is_match(&exec.output) {
            Ok(Verdict::pass(format!("output matches /{pattern}/")))
        } else {
            Ok(Verdict::fail(format!(
                "output of `{}` does not match /{pattern}/",
                exec.command
            )))
        }
    }
}

/// `probe` criteria: run a check command in the live environment.
pub struct ProbeValidator;

#[async_trait]
impl StepValidator for ProbeValidator {
    fn name(&self) -> &str {
        "probe"
    }

    async fn evaluate(
        &self,
        criterion: &SuccessCriterion,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, ValidationError> {
        let SuccessCriterion::Probe {
            command,
            expect_exit_code,
            expect_output,
        } = criterion
        else {
            return Err(mismatch(self.name(), criterion));
        };
        let output_re = expect_output.as_deref().map(compile).transpose()?;
        let environment = ctx.environment()?;

        debug!(session_id = %ctx.session_id, step_id = %ctx.step.id, command, "running probe");
        let timed_out = || {
            Verdict::fail(format!(
                "check command timed out after {}ms",
                ctx.probe_timeout.as_millis()
            ))
        };
        let out = match tokio::time::timeout(
            ctx.probe_timeout + TIMEOUT_GRACE,
            ctx.provisioner
                .run_command(environment, command, ctx.probe_timeout),
        )
        .await
        {
            Ok(Ok(out)) => out,
            Ok(Err(SandboxError::Timeout { .. })) | Err(_) => return Ok(timed_out()),
            Ok(Err(e)) => return Err(e.into()),
        };

        if out.exit_code != *expect_exit_code {
            return Ok(Verdict::fail(format!(
                "check failed: expected exit code {expect_exit_code}, got {}",
                out.exit_code
            )));
        }
        if let Some(re) = output_re {
            if !re.is_match(&out.output) {
                return Ok(Verdict::fail(format!(
                    "check output {:?} does not match /{}/",
                    excerpt(&out.output),
                    re.as_str()
                )));
            }
        }
        Ok(Verdict::pass("environment check passed"))
    }
}
