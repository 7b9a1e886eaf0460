//! Error types for credflow-replication.

use credflow_types::ReplicaId;
use thiserror::Error;

/// A single visibility check failed.
///
/// Always transient: the prober turns it into
/// [`ProbeOutcome::Unreachable`](crate::ProbeOutcome::Unreachable) and the
/// replica is asked again on the next tick.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("replica {replica} unreachable: {reason}")]
    Unreachable { replica: ReplicaId, reason: String },

    #[error("replica {replica} rejected the check: {reason}")]
    Rejected { replica: ReplicaId, reason: String },
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("invalid replication settings: {0}")]
    InvalidSettings(String),
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;
