//! Sandbox environment references.
//!
//! The engine never owns an environment's internals: it records what the
//! provisioner reported (id, status, endpoints, resources) and asks the
//! provisioner to act on it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::EnvironmentId;

/// Status of an external environment as last observed by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// Provisioner accepted the request; not yet usable.
    Provisioning,
    /// Ready to run commands.
    Ready,
    /// Provider reported an unrecoverable fault.
    Error,
    /// Teardown has been requested.
    Terminating,
    /// Teardown finished (or was attempted).
    Terminated,
}

impl EnvironmentStatus {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU / memory / storage descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSpec {
    /// CPU allotment, e.g. `"500m"` or `"2"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory allotment, e.g. `"512Mi"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Ephemeral storage allotment, e.g. `"1Gi"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// What to ask the provisioner for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentSpec {
    /// Image or template name understood by the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Requested resources.
    pub resources: ResourceSpec,
    /// Environment variables to set inside the sandbox.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Free-form labels (the engine adds `session`, `workshop` and `user`).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A provisioned environment, as tracked by a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Provider-assigned identifier.
    pub id: EnvironmentId,
    /// Last observed status.
    pub status: EnvironmentStatus,
    /// Named endpoints exposed by the environment (e.g. `"api"`).
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    /// Resources actually granted.
    #[serde(default)]
    pub resources: ResourceSpec,
}

impl Environment {
    /// Create a ready environment with no endpoints.
    pub fn ready(id: EnvironmentId, resources: ResourceSpec) -> Self {
        Self {
            id,
            status: EnvironmentStatus::Ready,
            endpoints: BTreeMap::new(),
            resources,
        }
    }

    /// Add a named endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        let _ = self.endpoints.insert(name.into(), url.into());
        self
    }
}
