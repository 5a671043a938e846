//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file only needs the keys it overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings type for the dojo engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DojoSettings {
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Session lifetime settings.
    pub session: SessionSettings,
    /// Command execution settings.
    pub execution: ExecutionSettings,
    /// Attempt-based scoring settings.
    pub scoring: ScoringSettings,
    /// Sandbox provisioner settings.
    pub provisioner: ProvisionerSettings,
    /// Workshop catalog settings.
    pub workshops: WorkshopSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum number of non-terminal sessions across all users.
    pub max_concurrent_sessions: usize,
    /// How long shutdown waits for sessions to wind down.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8470,
            max_concurrent_sessions: 200,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Session lifetime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// TTL applied when a workshop does not set its own.
    pub default_ttl_secs: u64,
    /// How long terminal sessions stay queryable before being reaped.
    pub retention_secs: u64,
    /// Period of the background expiration sweep.
    pub sweep_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            retention_secs: 600,
            sweep_interval_ms: 5000,
        }
    }
}

/// Command execution settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionSettings {
    /// Timeout used when a request does not specify one.
    pub default_timeout_ms: u64,
    /// Upper bound on requested timeouts.
    pub max_timeout_ms: u64,
    /// Command executions kept per session; oldest are evicted.
    pub history_cap: usize,
    /// Recorded output is truncated past this many bytes.
    pub max_output_bytes: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            history_cap: 50,
            max_output_bytes: 65_536,
        }
    }
}

/// Scoring policy selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringPolicyKind {
    /// Award shrinks with each extra attempt, down to a floor.
    #[default]
    Decay,
    /// Always award full points.
    Flat,
}

/// Attempt-based scoring settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringSettings {
    /// Which policy to use.
    pub policy: ScoringPolicyKind,
    /// Percent of the point value lost per attempt after the first.
    pub decay_percent: u32,
    /// Minimum award as a percent of the point value (never below one point).
    pub floor_percent: u32,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            policy: ScoringPolicyKind::Decay,
            decay_percent: 25,
            floor_percent: 10,
        }
    }
}

/// Which provisioner backend to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    /// Remote sandbox provider over HTTP.
    Http,
    /// Local working directories and subprocesses (development only).
    #[default]
    Local,
}

/// Sandbox provisioner settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionerSettings {
    /// Backend selector.
    pub kind: ProvisionerKind,
    /// Base URL of the HTTP provider.
    pub base_url: String,
    /// Timeout for provision/teardown requests.
    pub request_timeout_ms: u64,
    /// Bearer token for the HTTP provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Root directory for local environments.
    pub local_root: PathBuf,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            kind: ProvisionerKind::Local,
            base_url: "http://127.0.0.1:8790".to_string(),
            request_timeout_ms: 60_000,
            api_token: None,
            local_root: std::env::temp_dir().join("dojo-envs"),
        }
    }
}

/// Workshop catalog settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkshopSettings {
    /// JSON file holding an array of workshops.
    pub path: PathBuf,
}

impl Default for WorkshopSettings {
    fn default() -> Self {
        Self {
            path: crate::loader::dojo_home().join("workshops.json"),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
