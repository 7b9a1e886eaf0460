//! In-memory collaborators for development and testing.
//!
//! A toy directory with a primary copy and per-replica copies that catch
//! up on demand, a token store and a challenge recorder.
//! Not suitable for production use.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use credflow_replication::{DirectoryProbe, Expectation, ProbeError};
use credflow_types::{
    FormData, PasswordData, ReplicaEndpoint, ReplicaId, TokenChannel, TokenKey, UserIdentity,
};
use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use crate::collaborators::{
    AttributeVerifier, ChallengeDelivery, CollaboratorError, CollaboratorResult, DirectoryWriter,
    TokenIssuer, TokenPayload, WritePayload,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub password: Option<PasswordData>,
    pub attributes: BTreeMap<String, String>,
}

/// Directory with a primary node and lagging replicas.
pub struct MemoryDirectory {
    primary: DashMap<UserIdentity, DirectoryEntry>,
    replicas: DashMap<ReplicaId, HashMap<UserIdentity, DirectoryEntry>>,
    unreachable: DashSet<ReplicaId>,
    auto_propagate: AtomicBool,
    reject_writes: AtomicBool,
    fail_after_create: AtomicBool,
    writes: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            primary: DashMap::new(),
            replicas: DashMap::new(),
            unreachable: DashSet::new(),
            auto_propagate: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            fail_after_create: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Register replicas. Each starts as a copy of the primary.
    pub fn with_replicas(self, endpoints: &[ReplicaEndpoint]) -> Self {
        for endpoint in endpoints {
            let snapshot = self.primary_snapshot();
            self.replicas.insert(endpoint.id.clone(), snapshot);
        }
        self
    }

    /// Copy every write to all replicas immediately.
    pub fn with_auto_propagate(self) -> Self {
        self.auto_propagate.store(true, Ordering::SeqCst);
        self
    }

    /// Seed an entry on the primary and every replica.
    pub fn add_entry(&self, identity: UserIdentity, entry: DirectoryEntry) {
        self.primary.insert(identity.clone(), entry.clone());
        for mut replica in self.replicas.iter_mut() {
            replica.insert(identity.clone(), entry.clone());
        }
    }

    pub fn entry(&self, identity: &UserIdentity) -> Option<DirectoryEntry> {
        self.primary.get(identity).map(|e| e.clone())
    }

    /// Bring one replica up to date with the primary.
    pub fn propagate(&self, replica: &ReplicaId) {
        let snapshot = self.primary_snapshot();
        if let Some(mut view) = self.replicas.get_mut(replica) {
            *view = snapshot;
        }
    }

    pub fn propagate_all(&self) {
        let snapshot = self.primary_snapshot();
        for mut view in self.replicas.iter_mut() {
            *view = snapshot.clone();
        }
    }

    pub fn set_unreachable(&self, replica: &ReplicaId, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(replica.clone());
        } else {
            self.unreachable.remove(replica);
        }
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Store created entries, then report the creation as failed.
    pub fn set_fail_after_create(&self, fail: bool) {
        self.fail_after_create.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every write call, successful or not.
    pub fn write_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn primary_snapshot(&self) -> HashMap<UserIdentity, DirectoryEntry> {
        self.primary
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryWriter for MemoryDirectory {
    async fn perform_write(
        &self,
        identity: &UserIdentity,
        payload: WritePayload,
    ) -> CollaboratorResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new("directory is read-only"));
        }
        match payload {
            WritePayload::SetPassword(password) => {
                let mut entry = self.primary.get_mut(identity).ok_or_else(|| {
                    CollaboratorError::new(format!("no such entry: {}", identity))
                })?;
                entry.password = Some(password);
            }
            WritePayload::CreateEntry(form) => {
                if self.primary.contains_key(identity) {
                    return Err(CollaboratorError::new(format!(
                        "entry already exists: {}",
                        identity
                    )));
                }
                self.primary.insert(
                    identity.clone(),
                    DirectoryEntry {
                        password: form.password.clone(),
                        attributes: form.fields.clone(),
                    },
                );
                if self.fail_after_create.load(Ordering::SeqCst) {
                    return Err(CollaboratorError::new(format!(
                        "entry {} created but could not be completed",
                        identity
                    )));
                }
            }
            WritePayload::DeleteEntry => {
                self.primary.remove(identity).ok_or_else(|| {
                    CollaboratorError::new(format!("no such entry: {}", identity))
                })?;
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.auto_propagate.load(Ordering::SeqCst) {
            self.propagate_all();
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryProbe for MemoryDirectory {
    async fn check_visibility(
        &self,
        replica: &ReplicaEndpoint,
        identity: &UserIdentity,
        expectation: &Expectation,
    ) -> Result<bool, ProbeError> {
        if self.unreachable.contains(&replica.id) {
            return Err(ProbeError::Unreachable {
                replica: replica.id.clone(),
                reason: "marked unreachable".into(),
            });
        }
        let view = self.replicas.get(&replica.id).ok_or_else(|| ProbeError::Rejected {
            replica: replica.id.clone(),
            reason: "unknown replica".into(),
        })?;
        let Some(entry) = view.get(identity) else {
            return Ok(false);
        };
        Ok(match expectation {
            Expectation::CredentialAccepted { credential } => {
                entry.password.as_ref() == Some(credential)
            }
            Expectation::AttributeEquals { attribute, value } => {
                entry.attributes.get(attribute) == Some(value)
            }
            Expectation::EntryPresent => true,
        })
    }
}

#[async_trait]
impl AttributeVerifier for MemoryDirectory {
    async fn verify_current_password(
        &self,
        identity: &UserIdentity,
        candidate: &PasswordData,
    ) -> CollaboratorResult<bool> {
        Ok(self
            .primary
            .get(identity)
            .and_then(|e| e.password.clone())
            .map(|p| p == *candidate)
            .unwrap_or(false))
    }

    async fn compare_attributes(
        &self,
        identity: &UserIdentity,
        values: &FormData,
    ) -> CollaboratorResult<Vec<String>> {
        let entry = self
            .primary
            .get(identity)
            .ok_or_else(|| CollaboratorError::new(format!("no such entry: {}", identity)))?;
        Ok(values
            .fields
            .iter()
            .filter(|(name, value)| entry.attributes.get(*name) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

/// Token store keyed by the code handed to the user.
pub struct MemoryTokenIssuer {
    tokens: DashMap<String, TokenPayload>,
}

impl MemoryTokenIssuer {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for MemoryTokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenIssuer for MemoryTokenIssuer {
    async fn create_token(
        &self,
        payload: TokenPayload,
        _lifetime: Duration,
    ) -> CollaboratorResult<TokenKey> {
        let code = Uuid::new_v4().simple().to_string()[..10].to_uppercase();
        self.tokens.insert(code.clone(), payload);
        Ok(TokenKey::new(code))
    }

    async fn redeem(&self, code: &str) -> CollaboratorResult<Option<TokenPayload>> {
        Ok(self.tokens.get(code).map(|p| p.clone()))
    }

    async fn revoke(&self, key: &TokenKey) -> CollaboratorResult<()> {
        self.tokens.remove(key.as_str());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentChallenge {
    pub channel: TokenChannel,
    pub destination: String,
    pub token: TokenKey,
}

/// Records challenges instead of delivering them.
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<SentChallenge>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentChallenge> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recent token delivered on a channel.
    pub fn last_token(&self, channel: TokenChannel) -> Option<TokenKey> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|c| c.channel == channel)
            .map(|c| c.token.clone())
    }
}

#[async_trait]
impl ChallengeDelivery for RecordingDelivery {
    async fn send_challenge(
        &self,
        channel: TokenChannel,
        destination: &str,
        token: &TokenKey,
    ) -> CollaboratorResult<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentChallenge {
                channel,
                destination: destination.to_string(),
                token: token.clone(),
            });
        Ok(())
    }
}
