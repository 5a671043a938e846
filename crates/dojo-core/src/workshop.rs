//! Workshop content as seen by the engine: ordered steps and how each is checked.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::EnvironmentSpec;
use crate::ids::{StepId, WorkshopId};

/// How a step decides it has been completed.
///
/// Output-based criteria look at the most recent completed command execution,
/// optionally restricted to commands matching `command_pattern`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SuccessCriterion {
    /// The relevant execution exited with `expected`.
    #[serde(rename_all = "camelCase")]
    ExitCode {
        /// Required exit code.
        expected: i32,
        /// Restricts which execution is relevant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_pattern: Option<String>,
    },
    /// The relevant output equals `expected`.
    #[serde(rename_all = "camelCase")]
    OutputEquals {
        /// Required output.
        expected: String,
        /// Compare after trimming surrounding whitespace.
        #[serde(default = "default_true")]
        trim: bool,
        /// Restricts which execution is relevant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_pattern: Option<String>,
    },
    /// The relevant output contains `needle`.
    #[serde(rename_all = "camelCase")]
    OutputContains {
        /// Required substring.
        needle: String,
        /// Restricts which execution is relevant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_pattern: Option<String>,
    },
    /// The relevant output matches the regex `pattern`.
    #[serde(rename_all = "camelCase")]
    OutputMatches {
        /// Regex the output must match.
        pattern: String,
        /// Restricts which execution is relevant.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_pattern: Option<String>,
    },
    /// Run a check command in the live environment.
    #[serde(rename_all = "camelCase")]
    Probe {
        /// Command to run.
        command: String,
        /// Exit code that counts as success.
        #[serde(default)]
        expect_exit_code: i32,
        /// Optional regex the probe output must match.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_output: Option<String>,
    },
    /// Hand the decision to a named, externally registered validator.
    Delegated {
        /// Registered validator name.
        validator: String,
        /// Opaque parameters passed to the validator.
        #[serde(default)]
        params: Value,
    },
}

fn default_true() -> bool {
    true
}

impl SuccessCriterion {
    /// Name of the evaluator that handles this criterion.
    pub fn kind(&self) -> &str {
        match self {
            Self::ExitCode { .. } => "exitCode",
            Self::OutputEquals { .. } => "outputEquals",
            Self::OutputContains { .. } => "outputContains",
            Self::OutputMatches { .. } => "outputMatches",
            Self::Probe { .. } => "probe",
            Self::Delegated { validator, .. } => validator,
        }
    }

    /// Whether evaluating this criterion runs a command in the environment.
    pub fn runs_in_environment(&self) -> bool {
        matches!(self, Self::Probe { .. })
    }
}

/// One ordered unit of a workshop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Step identifier, unique within the workshop.
    pub id: StepId,
    /// Short human title.
    #[serde(default)]
    pub title: String,
    /// Full point value for a first-attempt success.
    pub points: u32,
    /// How completion is decided.
    pub criterion: SuccessCriterion,
    /// Shown alongside failure feedback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// A workshop definition from the content catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workshop {
    /// Workshop identifier.
    pub id: WorkshopId,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Sandbox template for sessions of this workshop.
    #[serde(default)]
    pub environment: EnvironmentSpec,
    /// TTL override in seconds; the configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Ordered steps.
    pub steps: Vec<StepDefinition>,
}

impl Workshop {
    /// Sum of all step point values.
    pub fn max_score(&self) -> u64 {
        self.steps.iter().map(|s| u64::from(s.points)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn criterion_tagged_json() {
        let c: SuccessCriterion = serde_json::from_value(json!({
            "type": "outputContains",
            "needle": "hello"
        }))
        .unwrap();
        assert_eq!(
            c,
            SuccessCriterion::OutputContains {
                needle: "hello".into(),
                command_pattern: None
            }
        );
        assert_eq!(c.kind(), "outputContains");
    }

    #[test]
    fn output_equals_trims_by_default() {
        let c: SuccessCriterion =
            serde_json::from_value(json!({"type": "outputEquals", "expected": "42"})).unwrap();
        assert!(matches!(c, SuccessCriterion::OutputEquals { trim: true, .. }));
    }

    #[test]
    fn probe_defaults_to_exit_zero() {
        let c: SuccessCriterion = serde_json::from_value(json!({
            "type": "probe",
            "command": "test -f /app/done",
        }))
        .unwrap();
        match c {
            SuccessCriterion::Probe {
                expect_exit_code,
                expect_output,
                ..
            } => {
                assert_eq!(expect_exit_code, 0);
                assert!(expect_output.is_none());
            }
            other => panic!("unexpected criterion: {other:?}"),
        }
    }

    #[test]
    fn delegated_kind_is_validator_name() {
        let c = SuccessCriterion::Delegated {
            validator: "k8s-pod-running".into(),
            params: json!({"pod": "web"}),
        };
        assert_eq!(c.kind(), "k8s-pod-running");
        assert!(!c.runs_in_environment());
    }

    #[test]
    fn only_probes_run_in_environment() {
        let probe = SuccessCriterion::Probe {
            command: "test -d /srv".into(),
            expect_exit_code: 0,
            expect_output: None,
        };
        assert!(probe.runs_in_environment());
        let exit = SuccessCriterion::ExitCode {
            expected: 0,
            command_pattern: None,
        };
        assert!(!exit.runs_in_environment());
    }

    #[test]
    fn workshop_from_catalog_json() {
        let w: Workshop = serde_json::from_value(json!({
            "id": "git-basics",
            "title": "Git basics",
            "ttlSecs": 1800,
            "environment": {"image": "alpine/git"},
            "steps": [
                {"id": "init", "points": 10, "criterion": {"type": "exitCode", "expected": 0}},
                {"id": "commit", "points": 20, "hint": "use git commit -m",
                 "criterion": {"type": "outputMatches", "pattern": "\\d+ file"}}
            ]
        }))
        .unwrap();
        assert_eq!(w.steps.len(), 2);
        assert_eq!(w.ttl_secs, Some(1800));
        assert_eq!(w.max_score(), 30);
        assert_eq!(w.steps[1].hint.as_deref(), Some("use git commit -m"));
        assert_eq!(w.environment.image.as_deref(), Some("alpine/git"));
    }
}
