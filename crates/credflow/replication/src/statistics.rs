//! Completion-duration statistics.
//!
//! The ceiling of every new tracker is derived from how long past writes
//! took to propagate. Persistence of the figure is the embedder's business;
//! [`EwmaCompletionStatistics`] keeps it in memory.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use credflow_types::ReplicationSettings;

/// Feedback channel for completed replication waits.
pub trait CompletionStatistics: Send + Sync {
    fn record_completion_duration(&self, duration: Duration);

    /// Moving average of recorded durations, `None` without history.
    fn average_completion_duration(&self) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, Default)]
struct EwmaState {
    mean_ms: f64,
    samples: u64,
}

/// Exponentially weighted moving average of completion durations.
///
/// The first sample seeds the mean; later samples move it by `alpha`.
#[derive(Debug)]
pub struct EwmaCompletionStatistics {
    alpha: f64,
    state: Mutex<EwmaState>,
}

impl EwmaCompletionStatistics {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            state: Mutex::new(EwmaState::default()),
        }
    }

    /// Smoothing factor taken from the replication settings.
    pub fn from_settings(settings: &ReplicationSettings) -> Self {
        Self::new(settings.statistics_alpha)
    }

    /// Restore from a persisted average.
    pub fn with_history(alpha: f64, average: Duration, samples: u64) -> Self {
        let stats = Self::new(alpha);
        {
            let mut state = stats.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.mean_ms = average.as_secs_f64() * 1000.0;
            state.samples = samples;
        }
        stats
    }

    pub fn sample_count(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples
    }
}

impl CompletionStatistics for EwmaCompletionStatistics {
    fn record_completion_duration(&self, duration: Duration) {
        let value = duration.as_secs_f64() * 1000.0;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.mean_ms = if state.samples == 0 {
            value
        } else {
            (1.0 - self.alpha) * state.mean_ms + self.alpha * value
        };
        state.samples += 1;
    }

    fn average_completion_duration(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.samples == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(state.mean_ms.max(0.0) / 1000.0))
    }
}
