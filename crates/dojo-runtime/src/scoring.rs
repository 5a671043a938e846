//! Attempt-based scoring policies.
//!
//! A policy only maps `(points, attempts)` to an award; the lifecycle code
//! never hard-codes a curve.

use std::sync::Arc;

use dojo_settings::{ScoringPolicyKind, ScoringSettings};

/// Maps a step's point value and the attempt count at success to an award.
///
/// Implementations must never award more than `points` and must be
/// non-increasing in `attempts`.
pub trait ScoringPolicy: Send + Sync {
    /// Policy name for logs.
    fn name(&self) -> &str;

    /// Score for succeeding on attempt number `attempts` (1-based).
    fn award(&self, points: u32, attempts: u32) -> u32;
}

/// Linear decay per extra attempt, with a non-zero floor.
///
/// `award = max(points * (100 - decay * (attempts - 1)) / 100, floor)` where
/// `floor = max(1, points * floor_percent / 100)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecayScoring {
    decay_percent: u32,
    floor_percent: u32,
}

impl DecayScoring {
    /// Percentages above 100 are clamped.
    pub fn new(decay_percent: u32, floor_percent: u32) -> Self {
        Self {
            decay_percent: decay_percent.min(100),
            floor_percent: floor_percent.min(100),
        }
    }
}

impl Default for DecayScoring {
    fn default() -> Self {
        Self::new(25, 10)
    }
}

impl ScoringPolicy for DecayScoring {
    fn name(&self) -> &str {
        "decay"
    }

    fn award(&self, points: u32, attempts: u32) -> u32 {
        if points == 0 {
            return 0;
        }
        let points = u64::from(points);
        let extra = u64::from(attempts.saturating_sub(1));
        let kept_percent = 100u64.saturating_sub(u64::from(self.decay_percent) * extra);
        let decayed = points * kept_percent / 100;
        let floor = (points * u64::from(self.floor_percent) / 100).max(1);
        let award = decayed.max(floor).min(points);
        u32::try_from(award).unwrap_or(u32::MAX)
    }
}

/// Full points regardless of attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlatScoring;

impl ScoringPolicy for FlatScoring {
    fn name(&self) -> &str {
        "flat"
    }

    fn award(&self, points: u32, _attempts: u32) -> u32 {
        points
    }
}

/// Build the configured policy.
pub fn policy_from_settings(settings: &ScoringSettings) -> Arc<dyn ScoringPolicy> {
    match settings.policy {
        ScoringPolicyKind::Decay => Arc::new(DecayScoring::new(
            settings.decay_percent,
            settings.floor_percent,
        )),
        ScoringPolicyKind::Flat => Arc::new(FlatScoring),
    }
}
