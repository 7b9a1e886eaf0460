//! Maximum wait for a replication tracker.
//!
//! Fixed once when a tracker starts: `average × multiplier` from history,
//! or the configured default without history, clamped to
//! `[min_wait, max_wait]`.

use std::time::Duration;

use credflow_types::ReplicationSettings;
use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, ReplicationResult};
use crate::statistics::CompletionStatistics;

/// Where a ceiling came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeilingSource {
    /// Derived from recorded completion durations.
    Historical,
    /// No history; configured default.
    Default,
    /// Set explicitly by the caller.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ceiling {
    pub duration: Duration,
    pub source: CeilingSource,
}

impl Ceiling {
    pub fn fixed(duration: Duration) -> Self {
        Self {
            duration,
            source: CeilingSource::Fixed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CeilingPolicy {
    default: Duration,
    min_wait: Duration,
    max_wait: Duration,
    multiplier: f64,
}

impl CeilingPolicy {
    pub fn new(
        default: Duration,
        min_wait: Duration,
        max_wait: Duration,
        multiplier: f64,
    ) -> ReplicationResult<Self> {
        if min_wait > max_wait {
            return Err(ReplicationError::InvalidSettings(format!(
                "min_wait {:?} exceeds max_wait {:?}",
                min_wait, max_wait
            )));
        }
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(ReplicationError::InvalidSettings(format!(
                "multiplier must be positive, got {}",
                multiplier
            )));
        }
        Ok(Self {
            default,
            min_wait,
            max_wait,
            multiplier,
        })
    }

    pub fn from_settings(settings: &ReplicationSettings) -> ReplicationResult<Self> {
        Self::new(
            Duration::from_millis(settings.default_ceiling_ms),
            Duration::from_millis(settings.min_wait_ms),
            Duration::from_millis(settings.max_wait_ms),
            settings.average_multiplier,
        )
    }

    pub fn compute(&self, stats: &dyn CompletionStatistics) -> Ceiling {
        match stats.average_completion_duration() {
            Some(average) => Ceiling {
                duration: average
                    .mul_f64(self.multiplier)
                    .clamp(self.min_wait, self.max_wait),
                source: CeilingSource::Historical,
            },
            None => Ceiling {
                duration: self.default.clamp(self.min_wait, self.max_wait),
                source: CeilingSource::Default,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::EwmaCompletionStatistics;

    fn policy() -> CeilingPolicy {
        CeilingPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(2),
            Duration::from_secs(60),
            1.5,
        )
        .unwrap()
    }

    #[test]
    fn test_default_without_history() {
        let stats = EwmaCompletionStatistics::new(0.1);
        let ceiling = policy().compute(&stats);
        assert_eq!(ceiling.duration, Duration::from_secs(30));
        assert_eq!(ceiling.source, CeilingSource::Default);
    }

    #[test]
    fn test_historical_average_scaled() {
        let stats = EwmaCompletionStatistics::with_history(0.1, Duration::from_secs(10), 5);
        let ceiling = policy().compute(&stats);
        assert_eq!(ceiling.duration, Duration::from_secs(15));
        assert_eq!(ceiling.source, CeilingSource::Historical);
    }

    #[test]
    fn test_historical_average_clamped() {
        let fast = EwmaCompletionStatistics::with_history(0.1, Duration::from_millis(100), 5);
        assert_eq!(policy().compute(&fast).duration, Duration::from_secs(2));

        let slow = EwmaCompletionStatistics::with_history(0.1, Duration::from_secs(600), 5);
        assert_eq!(policy().compute(&slow).duration, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        assert!(CeilingPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(1),
            1.0
        )
        .is_err());
        assert!(CeilingPolicy::new(
            Duration::from_secs(1),
            Duration::ZERO,
            Duration::from_secs(1),
            0.0
        )
        .is_err());
    }
}
