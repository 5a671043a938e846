//! Settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`DojoSettings::default()`]
//! 2. If the settings file exists, merge its values over the defaults (`figment`)
//! 3. Apply `DOJO_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints

use std::path::{Path, PathBuf};

use figment::providers::{Format, Json, Serialized};
use figment::Figment;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{DojoSettings, LogFormat, ProvisionerKind};

/// Resolve the dojo home directory (`~/.dojo`).
pub fn dojo_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".dojo")
}

/// Resolve the path to the settings file (`~/.dojo/settings.json`).
pub fn settings_path() -> PathBuf {
    dojo_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DojoSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a malformed file is an error.
pub fn load_settings_from_path(path: &Path) -> Result<DojoSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Defaults merged with the settings file, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<DojoSettings> {
    let mut figment = Figment::from(Serialized::defaults(DojoSettings::default()));
    if path.exists() {
        debug!(?path, "loading settings from file");
        figment = figment.merge(Json::file(path));
    } else {
        debug!(?path, "settings file not found, using defaults");
    }
    Ok(figment.extract()?)
}

/// Check constraints that serde cannot express.
pub fn validate(settings: &DojoSettings) -> Result<()> {
    let exec = &settings.execution;
    if exec.history_cap == 0 {
        return Err(SettingsError::InvalidValue(
            "execution.historyCap must be at least 1".into(),
        ));
    }
    if exec.default_timeout_ms == 0 || exec.default_timeout_ms > exec.max_timeout_ms {
        return Err(SettingsError::InvalidValue(format!(
            "execution.defaultTimeoutMs ({}) must be in 1..=maxTimeoutMs ({})",
            exec.default_timeout_ms, exec.max_timeout_ms
        )));
    }
    if settings.scoring.decay_percent > 100 || settings.scoring.floor_percent > 100 {
        return Err(SettingsError::InvalidValue(
            "scoring percentages must be within 0..=100".into(),
        ));
    }
    if settings.session.default_ttl_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "session.defaultTtlSecs must be positive".into(),
        ));
    }
    if settings.session.sweep_interval_ms < 10 {
        return Err(SettingsError::InvalidValue(
            "session.sweepIntervalMs must be at least 10".into(),
        ));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut DojoSettings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup.
pub fn apply_overrides_from(settings: &mut DojoSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("DOJO_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("DOJO_PORT", 1, 65_535) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }
    if let Some(v) = env.u64_in("DOJO_MAX_SESSIONS", 1, 100_000) {
        settings.server.max_concurrent_sessions = usize::try_from(v).unwrap_or(usize::MAX);
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = env.u64_in("DOJO_SESSION_TTL_SECS", 1, 7 * 24 * 3600) {
        settings.session.default_ttl_secs = v;
    }
    if let Some(v) = env.u64_in("DOJO_RETENTION_SECS", 0, 7 * 24 * 3600) {
        settings.session.retention_secs = v;
    }
    if let Some(v) = env.u64_in("DOJO_SWEEP_INTERVAL_MS", 10, 3_600_000) {
        settings.session.sweep_interval_ms = v;
    }

    // ── Execution ───────────────────────────────────────────────────
    if let Some(v) = env.u64_in("DOJO_DEFAULT_TIMEOUT_MS", 1, 3_600_000) {
        settings.execution.default_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("DOJO_MAX_TIMEOUT_MS", 1, 3_600_000) {
        settings.execution.max_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("DOJO_HISTORY_CAP", 1, 10_000) {
        settings.execution.history_cap = usize::try_from(v).unwrap_or(usize::MAX);
    }

    // ── Provisioner ─────────────────────────────────────────────────
    if let Some(v) = env.string("DOJO_PROVISIONER") {
        match v.to_lowercase().as_str() {
            "http" => settings.provisioner.kind = ProvisionerKind::Http,
            "local" => settings.provisioner.kind = ProvisionerKind::Local,
            _ => warn!(key = "DOJO_PROVISIONER", value = %v, "unknown provisioner, ignoring"),
        }
    }
    if let Some(v) = env.string("DOJO_PROVISIONER_URL") {
        settings.provisioner.base_url = v;
    }
    if let Some(v) = env.string("DOJO_PROVISIONER_TOKEN") {
        settings.provisioner.api_token = Some(v);
    }

    // ── Workshops / logging ─────────────────────────────────────────
    if let Some(v) = env.string("DOJO_WORKSHOPS_PATH") {
        settings.workshops.path = PathBuf::from(v);
    }
    if let Some(v) = env.string("DOJO_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("DOJO_LOG_FORMAT") {
        match v.to_lowercase().as_str() {
            "json" => settings.logging.format = LogFormat::Json,
            "pretty" => settings.logging.format = LogFormat::Pretty,
            _ => warn!(key = "DOJO_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

// ── Pure parsing functions ───────────────────────────────────────────────────

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn overrides(pairs: &[(&str, &str)]) -> DojoSettings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut s = DojoSettings::default();
        apply_overrides_from(&mut s, |k| map.get(k).cloned());
        s
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_file_layer(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.server.port, 8470);
        assert_eq!(s.execution.history_cap, 50);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"session": {{"defaultTtlSecs": 120}}, "scoring": {{"policy": "flat"}}}}"#
        )
        .unwrap();
        let s = load_file_layer(f.path()).unwrap();
        assert_eq!(s.session.default_ttl_secs, 120);
        assert_eq!(s.session.retention_secs, 600);
        assert_eq!(s.scoring.policy, crate::ScoringPolicyKind::Flat);
        assert_eq!(s.scoring.decay_percent, 25);
    }

    #[test]
    fn malformed_file_is_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{not json").unwrap();
        assert!(load_file_layer(f.path()).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let s = overrides(&[
            ("DOJO_PORT", "9000"),
            ("DOJO_SESSION_TTL_SECS", "900"),
            ("DOJO_HISTORY_CAP", "5"),
            ("DOJO_PROVISIONER", "HTTP"),
            ("DOJO_PROVISIONER_URL", "http://sandbox:1"),
            ("DOJO_LOG_FORMAT", "json"),
        ]);
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.session.default_ttl_secs, 900);
        assert_eq!(s.execution.history_cap, 5);
        assert_eq!(s.provisioner.kind, ProvisionerKind::Http);
        assert_eq!(s.provisioner.base_url, "http://sandbox:1");
        assert_eq!(s.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let s = overrides(&[
            ("DOJO_PORT", "0"),
            ("DOJO_HISTORY_CAP", "lots"),
            ("DOJO_PROVISIONER", "kubernetes"),
            ("DOJO_HOST", ""),
        ]);
        assert_eq!(s.server.port, 8470);
        assert_eq!(s.execution.history_cap, 50);
        assert_eq!(s.provisioner.kind, ProvisionerKind::Local);
        assert_eq!(s.server.host, "0.0.0.0");
    }

    #[test]
    fn parse_range() {
        assert_eq!(parse_u64_range("10", 1, 100), Some(10));
        assert_eq!(parse_u64_range(" 10 ", 1, 100), Some(10));
        assert_eq!(parse_u64_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("101", 1, 100), None);
        assert_eq!(parse_u64_range("-1", 0, 100), None);
    }

    #[test]
    fn validate_defaults_ok() {
        assert!(validate(&DojoSettings::default()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_timeouts() {
        let mut s = DojoSettings::default();
        s.execution.default_timeout_ms = s.execution.max_timeout_ms + 1;
        assert!(matches!(validate(&s), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_history_cap() {
        let mut s = DojoSettings::default();
        s.execution.history_cap = 0;
        assert!(validate(&s).is_err());
    }

    #[test]
    fn validate_rejects_percent_over_100() {
        let mut s = DojoSettings::default();
        s.scoring.floor_percent = 150;
        assert!(validate(&s).is_err());
    }
}
