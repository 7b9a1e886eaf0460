//! Replication progress tracker.
//!
//! Created right after a successful write. Each [`tick`] probes the
//! replicas that have not confirmed yet and reports a percentage:
//!
//! - Enumerated topology: `round(confirmed / total × 100)`, held below 100
//!   until every replica confirms.
//! - Unknown topology: `elapsed / ceiling × 100`, held below 100 until the
//!   ceiling passes.
//!
//! Once the ceiling passes the write is assumed complete regardless of
//! what the replicas report. A replica in `Confirmed` never goes back, and
//! the reported percentage never decreases, even under concurrent ticks.
//!
//! The tracker holds no reference to the session that owns it.
//!
//! [`tick`]: ReplicationProgressTracker::tick

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use credflow_types::{ReplicaEndpoint, ReplicaId, UserIdentity};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ceiling::Ceiling;
use crate::prober::{Expectation, ProbeOutcome, ReplicaProber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaStatus {
    Unknown,
    Confirmed,
    Unreachable,
}

/// The set of replicas a write must reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "replicas")]
pub enum ReplicaTopology {
    Enumerated(Vec<ReplicaEndpoint>),
    Unknown,
}

impl ReplicaTopology {
    /// An empty list means the replicas cannot be enumerated.
    pub fn from_endpoints(endpoints: Vec<ReplicaEndpoint>) -> Self {
        if endpoints.is_empty() {
            ReplicaTopology::Unknown
        } else {
            ReplicaTopology::Enumerated(endpoints)
        }
    }

    pub fn endpoints(&self) -> &[ReplicaEndpoint] {
        match self {
            ReplicaTopology::Enumerated(endpoints) => endpoints,
            ReplicaTopology::Unknown => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDetail {
    pub replica: ReplicaId,
    pub status: ReplicaStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl ReplicaDetail {
    fn unknown(replica: ReplicaId) -> Self {
        Self {
            replica,
            status: ReplicaStatus::Unknown,
            confirmed_at: None,
            attempts: 0,
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub percent_complete: u8,
    pub complete: bool,
    /// Completion was assumed because the ceiling passed before every
    /// enumerated replica confirmed.
    pub timed_out: bool,
    pub elapsed: Duration,
    pub replicas: Vec<ReplicaDetail>,
    /// Total wait, present once complete. Fed back into the statistics.
    pub completion_duration: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn response(&self) -> ProgressResponse {
        ProgressResponse {
            percent_complete: self.percent_complete,
            complete: self.complete,
        }
    }
}

/// Body returned to a polling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub percent_complete: u8,
    pub complete: bool,
}

impl ProgressResponse {
    pub fn finished() -> Self {
        Self {
            percent_complete: 100,
            complete: true,
        }
    }
}

/// Serialized form of a tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerState {
    pub begin_time: DateTime<Utc>,
    pub ceiling: Ceiling,
    pub identity: UserIdentity,
    pub expectation: Expectation,
    pub topology: ReplicaTopology,
    pub replicas: Vec<ReplicaDetail>,
    pub high_water_percent: u8,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(into = "TrackerState", from = "TrackerState")]
pub struct ReplicationProgressTracker {
    begin_time: DateTime<Utc>,
    ceiling: Ceiling,
    identity: UserIdentity,
    expectation: Expectation,
    topology: ReplicaTopology,
    statuses: RwLock<BTreeMap<ReplicaId, ReplicaDetail>>,
    high_water: AtomicU8,
}

impl ReplicationProgressTracker {
    pub fn start(
        identity: UserIdentity,
        expectation: Expectation,
        topology: ReplicaTopology,
        ceiling: Ceiling,
        begin_time: DateTime<Utc>,
    ) -> Self {
        let statuses = topology
            .endpoints()
            .iter()
            .map(|e| (e.id.clone(), ReplicaDetail::unknown(e.id.clone())))
            .collect();

        info!(
            identity = %identity,
            replicas = topology.endpoints().len(),
            ceiling_ms = ceiling.duration.as_millis() as u64,
            ceiling_source = ?ceiling.source,
            "Replication tracker started"
        );

        Self {
            begin_time,
            ceiling,
            identity,
            expectation,
            topology,
            statuses: RwLock::new(statuses),
            high_water: AtomicU8::new(0),
        }
    }

    pub fn begin_time(&self) -> DateTime<Utc> {
        self.begin_time
    }

    pub fn ceiling(&self) -> Ceiling {
        self.ceiling
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn topology(&self) -> &ReplicaTopology {
        &self.topology
    }

    pub fn max_completion_deadline(&self) -> DateTime<Utc> {
        let ceiling_ms = self.ceiling.duration.as_millis() as i64;
        self.begin_time + chrono::Duration::milliseconds(ceiling_ms)
    }

    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.begin_time).to_std().unwrap_or(Duration::ZERO)
    }

    /// Probe pending replicas and report progress as of now.
    pub async fn tick(&self, prober: &ReplicaProber) -> ProgressSnapshot {
        self.tick_at(prober, Utc::now()).await
    }

    pub async fn tick_at(&self, prober: &ReplicaProber, now: DateTime<Utc>) -> ProgressSnapshot {
        if !self.is_terminal_at(now) {
            let pending = self.pending_replicas();
            if !pending.is_empty() {
                let results = prober
                    .probe_all(&pending, &self.identity, &self.expectation)
                    .await;
                self.record(results, now);
            }
        }
        self.snapshot_at(now)
    }

    /// Progress as of `now` without probing.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> ProgressSnapshot {
        let (percent, complete, timed_out) = self.compute(now);
        let previous = self.high_water.fetch_max(percent, Ordering::SeqCst);
        let percent_complete = percent.max(previous);
        let complete = complete || percent_complete >= 100;
        let elapsed = self.elapsed_at(now);

        ProgressSnapshot {
            percent_complete,
            complete,
            timed_out,
            elapsed,
            replicas: self.details(),
            completion_duration: complete.then_some(elapsed),
        }
    }

    /// Whether the tracker is done waiting as of `now`.
    pub fn is_terminal_at(&self, now: DateTime<Utc>) -> bool {
        self.compute(now).1 || self.high_water.load(Ordering::SeqCst) >= 100
    }

    pub fn details(&self) -> Vec<ReplicaDetail> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn pending_replicas(&self) -> Vec<ReplicaEndpoint> {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        self.topology
            .endpoints()
            .iter()
            .filter(|e| {
                statuses
                    .get(&e.id)
                    .map(|d| d.status != ReplicaStatus::Confirmed)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    fn record(&self, results: Vec<(ReplicaId, ProbeOutcome)>, now: DateTime<Utc>) {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        for (replica, outcome) in results {
            let Some(detail) = statuses.get_mut(&replica) else {
                continue;
            };
            detail.attempts = detail.attempts.saturating_add(1);
            if detail.status == ReplicaStatus::Confirmed {
                continue;
            }
            detail.status = match outcome {
                ProbeOutcome::Confirmed => {
                    detail.confirmed_at = Some(now);
                    debug!(replica = %replica, identity = %self.identity, "Replica caught up");
                    ReplicaStatus::Confirmed
                }
                ProbeOutcome::NotYet => ReplicaStatus::Unknown,
                ProbeOutcome::Unreachable => ReplicaStatus::Unreachable,
            };
        }
    }

    /// `(percent, complete, timed_out)` before the high-water mark.
    fn compute(&self, now: DateTime<Utc>) -> (u8, bool, bool) {
        let elapsed = self.elapsed_at(now);
        let ceiling_passed = elapsed >= self.ceiling.duration;

        match &self.topology {
            ReplicaTopology::Enumerated(endpoints) => {
                let total = endpoints.len();
                let confirmed = self
                    .statuses
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|d| d.status == ReplicaStatus::Confirmed)
                    .count();

                if confirmed >= total {
                    (100, true, false)
                } else if ceiling_passed {
                    (100, true, true)
                } else {
                    let percent = (confirmed as f64 / total as f64 * 100.0).round() as u8;
                    (percent.min(99), false, false)
                }
            }
            ReplicaTopology::Unknown => {
                if ceiling_passed {
                    (100, true, false)
                } else {
                    let ratio = elapsed.as_secs_f64() / self.ceiling.duration.as_secs_f64();
                    ((ratio * 100.0).floor().clamp(0.0, 99.0) as u8, false, false)
                }
            }
        }
    }
}

impl Clone for ReplicationProgressTracker {
    fn clone(&self) -> Self {
        TrackerState::from(self).into()
    }
}

impl From<&ReplicationProgressTracker> for TrackerState {
    fn from(tracker: &ReplicationProgressTracker) -> Self {
        TrackerState {
            begin_time: tracker.begin_time,
            ceiling: tracker.ceiling,
            identity: tracker.identity.clone(),
            expectation: tracker.expectation.clone(),
            topology: tracker.topology.clone(),
            replicas: tracker.details(),
            high_water_percent: tracker.high_water.load(Ordering::SeqCst),
        }
    }
}

impl From<ReplicationProgressTracker> for TrackerState {
    fn from(tracker: ReplicationProgressTracker) -> Self {
        TrackerState::from(&tracker)
    }
}

impl From<TrackerState> for ReplicationProgressTracker {
    fn from(state: TrackerState) -> Self {
        let mut statuses: BTreeMap<ReplicaId, ReplicaDetail> = state
            .topology
            .endpoints()
            .iter()
            .map(|e| (e.id.clone(), ReplicaDetail::unknown(e.id.clone())))
            .collect();
        for detail in state.replicas {
            if let Some(slot) = statuses.get_mut(&detail.replica) {
                *slot = detail;
            }
        }

        Self {
            begin_time: state.begin_time,
            ceiling: state.ceiling,
            identity: state.identity,
            expectation: state.expectation,
            topology: state.topology,
            statuses: RwLock::new(statuses),
            high_water: AtomicU8::new(state.high_water_percent.min(100)),
        }
    }
}
