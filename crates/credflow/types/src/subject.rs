//! Snapshot of the user a flow acts on, captured when the session starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the session's authentication came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    /// Regular login.
    #[default]
    Login,
    /// A public module such as forgotten-password recovery.
    PublicModule,
    /// Anonymous new-user registration.
    Registration,
}

/// Password state reported by the directory at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PasswordStatus {
    pub expired: bool,
    pub pre_expired: bool,
    pub violates_policy: bool,
    pub warn_period: bool,
    /// Earliest time the policy's minimum lifetime allows another change.
    pub next_allowed_change: Option<DateTime<Utc>>,
}


/// Facts about the subject the step resolver consults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubjectState {
    pub auth_source: AuthSource,
    pub password_status: PasswordStatus,
    /// The directory requires a new password before anything else.
    pub requires_new_password: bool,
    /// The application holds the user's current password in the session.
    pub current_password_known: bool,
    /// The user chose to skip the change from the expiry warning page.
    pub skip_new_password: bool,
}

impl SubjectState {
    /// Subject of a new-user registration.
    pub fn registration() -> Self {
        Self {
            auth_source: AuthSource::Registration,
            ..Self::default()
        }
    }

    pub fn with_password_status(mut self, status: PasswordStatus) -> Self {
        self.password_status = status;
        self
    }

    pub fn with_current_password_known(mut self, known: bool) -> Self {
        self.current_password_known = known;
        self
    }

    pub fn via_public_module(mut self) -> Self {
        self.auth_source = AuthSource::PublicModule;
        self
    }
}
