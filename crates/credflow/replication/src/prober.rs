//! Replica prober.
//!
//! Asks a single replica whether a write is visible there. The actual
//! directory query is delegated to a [`DirectoryProbe`] collaborator; the
//! prober adds the per-probe timeout and folds every failure into
//! [`ProbeOutcome::Unreachable`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use credflow_types::{PasswordData, ReplicaEndpoint, ReplicaId, ReplicationSettings, UserIdentity};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProbeError, ReplicationError, ReplicationResult};

/// What a replica must show for the write to count as propagated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Expectation {
    /// The replica accepts the new credential.
    CredentialAccepted { credential: PasswordData },
    /// An attribute holds the given value.
    AttributeEquals { attribute: String, value: String },
    /// The entry exists.
    EntryPresent,
}

impl std::fmt::Debug for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expectation::CredentialAccepted { .. } => f.write_str("CredentialAccepted"),
            Expectation::AttributeEquals { attribute, .. } => {
                write!(f, "AttributeEquals({})", attribute)
            }
            Expectation::EntryPresent => f.write_str("EntryPresent"),
        }
    }
}

/// Directory-side visibility check, supplied by the embedding application.
#[async_trait]
pub trait DirectoryProbe: Send + Sync {
    /// Whether `expectation` holds for `identity` on `replica`.
    async fn check_visibility(
        &self,
        replica: &ReplicaEndpoint,
        identity: &UserIdentity,
        expectation: &Expectation,
    ) -> Result<bool, ProbeError>;
}

/// Result of probing one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeOutcome {
    Confirmed,
    NotYet,
    Unreachable,
}

/// Probes replicas with a timeout and bounded parallelism.
#[derive(Clone)]
pub struct ReplicaProber {
    probe: Arc<dyn DirectoryProbe>,
    timeout: Duration,
    max_parallel: usize,
}

impl ReplicaProber {
    pub fn new(
        probe: Arc<dyn DirectoryProbe>,
        timeout: Duration,
        max_parallel: usize,
    ) -> ReplicationResult<Self> {
        if max_parallel == 0 {
            return Err(ReplicationError::InvalidSettings(
                "max_parallel must be at least 1".into(),
            ));
        }
        Ok(Self {
            probe,
            timeout,
            max_parallel,
        })
    }

    pub fn from_settings(
        probe: Arc<dyn DirectoryProbe>,
        settings: &ReplicationSettings,
    ) -> ReplicationResult<Self> {
        Self::new(
            probe,
            settings.probe_timeout(),
            settings.max_parallel_probes,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a single replica. Never fails: errors and timeouts are
    /// reported as [`ProbeOutcome::Unreachable`].
    pub async fn probe(
        &self,
        replica: &ReplicaEndpoint,
        identity: &UserIdentity,
        expectation: &Expectation,
    ) -> ProbeOutcome {
        let start = Instant::now();
        let check = self.probe.check_visibility(replica, identity, expectation);

        match tokio::time::timeout(self.timeout, check).await {
            Ok(Ok(true)) => {
                debug!(
                    replica = %replica.id,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Replica confirmed write"
                );
                ProbeOutcome::Confirmed
            }
            Ok(Ok(false)) => ProbeOutcome::NotYet,
            Ok(Err(e)) => {
                warn!(replica = %replica.id, error = %e, "Replica probe failed");
                ProbeOutcome::Unreachable
            }
            Err(_) => {
                warn!(
                    replica = %replica.id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Replica probe timed out"
                );
                ProbeOutcome::Unreachable
            }
        }
    }

    /// Probe several replicas concurrently, at most `max_parallel` at once.
    pub async fn probe_all(
        &self,
        replicas: &[ReplicaEndpoint],
        identity: &UserIdentity,
        expectation: &Expectation,
    ) -> Vec<(ReplicaId, ProbeOutcome)> {
        let probes: Vec<_> = replicas
            .iter()
            .map(|replica| async move {
                let outcome = self.probe(replica, identity, expectation).await;
                (replica.id.clone(), outcome)
            })
            .collect();
        stream::iter(probes)
            .buffer_unordered(self.max_parallel)
            .collect()
            .await
    }
}
