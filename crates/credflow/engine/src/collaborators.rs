//! External collaborators.
//!
//! The engine decides *when* to write, verify or notify; these traits do the
//! work. Implementations are injected through [`Services`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credflow_replication::{CompletionStatistics, DirectoryProbe};
use credflow_types::{
    FlowError, FormData, PasswordData, ProfileId, SessionId, TokenChannel, TokenKey, UserIdentity,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a collaborator. The message is logged and mapped
/// to an error code by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<CollaboratorError> for FlowError {
    fn from(e: CollaboratorError) -> Self {
        FlowError::Collaborator(e.0)
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// What a directory write should do.
#[derive(Debug, Clone)]
pub enum WritePayload {
    SetPassword(PasswordData),
    CreateEntry(FormData),
    /// Remove an entry left behind by a failed creation.
    DeleteEntry,
}

#[async_trait]
pub trait DirectoryWriter: Send + Sync {
    async fn perform_write(
        &self,
        identity: &UserIdentity,
        payload: WritePayload,
    ) -> CollaboratorResult<()>;
}

/// Read-side checks for the change-password form gate.
#[async_trait]
pub trait AttributeVerifier: Send + Sync {
    async fn verify_current_password(
        &self,
        identity: &UserIdentity,
        candidate: &PasswordData,
    ) -> CollaboratorResult<bool>;

    /// Compare submitted values with the directory. Returns the names of
    /// the attributes that did not match.
    async fn compare_attributes(
        &self,
        identity: &UserIdentity,
        values: &FormData,
    ) -> CollaboratorResult<Vec<String>>;
}

#[async_trait]
pub trait ChallengeDelivery: Send + Sync {
    async fn send_challenge(
        &self,
        channel: TokenChannel,
        destination: &str,
        token: &TokenKey,
    ) -> CollaboratorResult<()>;
}

/// What a verification token is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub channel: TokenChannel,
    pub session: SessionId,
    pub profile: Option<ProfileId>,
    pub form: Option<FormData>,
    pub expires_at: DateTime<Utc>,
}

/// Token store. Generation of the token material is its concern.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn create_token(
        &self,
        payload: TokenPayload,
        lifetime: Duration,
    ) -> CollaboratorResult<TokenKey>;

    /// Look up the payload bound to a code the user entered.
    async fn redeem(&self, code: &str) -> CollaboratorResult<Option<TokenPayload>>;

    async fn revoke(&self, key: &TokenKey) -> CollaboratorResult<()>;
}

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, response: Option<&str>) -> CollaboratorResult<bool>;
}

/// Password rule check. `Err` carries the violated rule.
pub trait PasswordPolicy: Send + Sync {
    fn check(
        &self,
        identity: Option<&UserIdentity>,
        candidate: &PasswordData,
    ) -> Result<(), String>;
}

/// All collaborators a flow needs.
#[derive(Clone)]
pub struct Services {
    pub writer: Arc<dyn DirectoryWriter>,
    pub probe: Arc<dyn DirectoryProbe>,
    pub verifier: Arc<dyn AttributeVerifier>,
    pub delivery: Arc<dyn ChallengeDelivery>,
    pub tokens: Arc<dyn TokenIssuer>,
    pub statistics: Arc<dyn CompletionStatistics>,
    pub captcha: Option<Arc<dyn CaptchaVerifier>>,
    pub password_policy: Option<Arc<dyn PasswordPolicy>>,
}

impl Services {
    pub fn new(
        writer: Arc<dyn DirectoryWriter>,
        probe: Arc<dyn DirectoryProbe>,
        verifier: Arc<dyn AttributeVerifier>,
        delivery: Arc<dyn ChallengeDelivery>,
        tokens: Arc<dyn TokenIssuer>,
        statistics: Arc<dyn CompletionStatistics>,
    ) -> Self {
        Self {
            writer,
            probe,
            verifier,
            delivery,
            tokens,
            statistics,
            captcha: None,
            password_policy: None,
        }
    }

    pub fn with_captcha(mut self, captcha: Arc<dyn CaptchaVerifier>) -> Self {
        self.captcha = Some(captcha);
        self
    }

    pub fn with_password_policy(mut self, policy: Arc<dyn PasswordPolicy>) -> Self {
        self.password_policy = Some(policy);
        self
    }
}
