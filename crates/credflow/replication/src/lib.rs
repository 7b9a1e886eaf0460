//! Replication completion tracking.
//!
//! After a write lands on the primary directory node, the other replicas
//! catch up on their own schedule. This crate answers "has it propagated
//! yet?":
//!
//! - [`ReplicaProber`] asks one replica whether the change is visible.
//! - [`ReplicationProgressTracker`] aggregates probe results across all
//!   replicas into a percentage, falling back to an elapsed-time estimate
//!   when the topology is unknown.
//! - [`CeilingPolicy`] fixes the longest wait from historical
//!   [`CompletionStatistics`].

#![deny(unsafe_code)]

pub mod ceiling;
pub mod error;
pub mod prober;
pub mod statistics;
pub mod tracker;

pub use ceiling::{Ceiling, CeilingPolicy, CeilingSource};
pub use error::{ProbeError, ReplicationError, ReplicationResult};
pub use prober::{DirectoryProbe, Expectation, ProbeOutcome, ReplicaProber};
pub use statistics::{CompletionStatistics, EwmaCompletionStatistics};
pub use tracker::{
    ProgressResponse, ProgressSnapshot, ReplicaDetail, ReplicaStatus, ReplicaTopology,
    ReplicationProgressTracker, TrackerState,
};
