//! Flow configuration.
//!
//! Loaded from TOML. Every section has defaults, so an empty file yields a
//! working change-password setup with new-user registration disabled.

use crate::errors::{FlowError, FlowResult};
use crate::ids::{ProfileId, ReplicaId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Longest accepted verification token lifetime (30 days).
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest accepted rate-limit window (one day).
pub const MAX_DISPATCH_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration for all flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub change_password: ChangePasswordSettings,
    pub new_user: NewUserSettings,
    pub tokens: TokenSettings,
    pub dispatch: DispatchSettings,
    pub replication: ReplicationSettings,
}

impl FlowConfig {
    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> FlowResult<Self> {
        let config: FlowConfig =
            toml::from_str(contents).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FlowResult<()> {
        self.replication.validate()?;

        if self.new_user.enabled && self.new_user.profiles.is_empty() {
            return Err(FlowError::Config(
                "new_user is enabled but no profiles are defined".into(),
            ));
        }
        for (id, profile) in &self.new_user.profiles {
            profile.validate(id)?;
        }
        check_range("tokens.lifetime_secs", self.tokens.lifetime_secs, MAX_TOKEN_LIFETIME_SECS)?;
        if self.dispatch.max_actions_per_window > 0 {
            check_range(
                "dispatch.window_secs",
                self.dispatch.window_secs,
                MAX_DISPATCH_WINDOW_SECS,
            )?;
        }
        Ok(())
    }
}

/// When the current password must be re-entered before a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequireCurrentPasswordMode {
    #[default]
    False,
    True,
    /// Only when the password is still valid; an expired password may be
    /// replaced without it.
    NotExpired,
}

/// A form field the user must fill in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl FormField {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn check_range(field: &str, value: u64, max: u64) -> FlowResult<()> {
    if value == 0 || value > max {
        return Err(FlowError::Config(format!(
            "{} must be between 1 and {} (got {})",
            field, max, value
        )));
    }
    Ok(())
}

/// `at + secs`, or a configuration error when the offset does not fit.
fn offset(at: DateTime<Utc>, secs: u64, field: &str) -> FlowResult<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| FlowError::Config(format!("{} out of range: {}", field, secs)))
}

fn non_blank(text: &Option<String>) -> Option<&str> {
    text.as_deref().filter(|t| !t.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangePasswordSettings {
    pub require_current_password: RequireCurrentPasswordMode,
    /// Agreement shown before the change page. Blank disables the step.
    pub agreement_text: Option<String>,
    /// Attributes the user must confirm before changing the password.
    pub required_form: Vec<FormField>,
    pub case_sensitive: bool,
    /// Apply the minimum password lifetime even when the directory demands
    /// a new password.
    pub enforce_minimum_lifetime_when_required: bool,
}

impl Default for ChangePasswordSettings {
    fn default() -> Self {
        Self {
            require_current_password: RequireCurrentPasswordMode::False,
            agreement_text: None,
            required_form: Vec::new(),
            case_sensitive: true,
            enforce_minimum_lifetime_when_required: true,
        }
    }
}

impl ChangePasswordSettings {
    pub fn agreement(&self) -> Option<&str> {
        non_blank(&self.agreement_text)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewUserSettings {
    pub enabled: bool,
    pub profiles: BTreeMap<ProfileId, NewUserProfile>,
}

impl NewUserSettings {
    pub fn profile(&self, id: &ProfileId) -> Option<&NewUserProfile> {
        self.profiles.get(id)
    }

    /// The profile to select without asking, when exactly one exists.
    pub fn sole_profile(&self) -> Option<&ProfileId> {
        if self.profiles.len() == 1 {
            self.profiles.keys().next()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewUserProfile {
    pub display_name: Option<String>,
    pub form: Vec<FormField>,
    /// Field whose value names the new directory entry.
    pub naming_field: String,
    pub email_field: String,
    pub phone_field: String,
    pub email_verification: bool,
    pub sms_verification: bool,
    pub agreement_text: Option<String>,
    /// How long to wait for the new entry to replicate before completing.
    pub minimum_wait_ms: u64,
    /// Delete the entry again when its creation fails part way.
    pub delete_on_fail: bool,
}

impl Default for NewUserProfile {
    fn default() -> Self {
        Self {
            display_name: None,
            form: Vec::new(),
            naming_field: "cn".into(),
            email_field: "mail".into(),
            phone_field: "mobile".into(),
            email_verification: false,
            sms_verification: false,
            agreement_text: None,
            minimum_wait_ms: 0,
            delete_on_fail: false,
        }
    }
}

impl NewUserProfile {
    pub fn agreement(&self) -> Option<&str> {
        non_blank(&self.agreement_text)
    }

    pub fn minimum_wait(&self) -> Duration {
        Duration::from_millis(self.minimum_wait_ms)
    }

    fn validate(&self, id: &ProfileId) -> FlowResult<()> {
        if self.naming_field.trim().is_empty() {
            return Err(FlowError::Config(format!("{}: naming_field is empty", id)));
        }
        if self.email_verification && self.email_field.trim().is_empty() {
            return Err(FlowError::Config(format!(
                "{}: email verification needs email_field",
                id
            )));
        }
        if self.sms_verification && self.phone_field.trim().is_empty() {
            return Err(FlowError::Config(format!(
                "{}: sms verification needs phone_field",
                id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub lifetime_secs: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            lifetime_secs: 3600,
        }
    }
}

impl TokenSettings {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }

    /// When a token issued at `issued_at` stops being accepted.
    pub fn expiry_after(&self, issued_at: DateTime<Utc>) -> FlowResult<DateTime<Utc>> {
        offset(issued_at, self.lifetime_secs, "tokens.lifetime_secs")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Actions accepted per session per window. Zero disables the limit.
    pub max_actions_per_window: u32,
    pub window_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_actions_per_window: 60,
            window_secs: 60,
        }
    }
}

impl DispatchSettings {
    /// End of a rate-limit window opened at `start`.
    pub fn window_end(&self, start: DateTime<Utc>) -> FlowResult<DateTime<Utc>> {
        offset(start, self.window_secs, "dispatch.window_secs")
    }
}

/// A directory replica to probe after a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEndpoint {
    pub id: ReplicaId,
    pub address: String,
}

impl ReplicaEndpoint {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: ReplicaId::new(id),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    /// Known replicas. Empty means the topology is unknown and progress is
    /// estimated from elapsed time alone.
    pub replicas: Vec<ReplicaEndpoint>,
    /// Ceiling used when no completion history exists.
    pub default_ceiling_ms: u64,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    /// Historical average is multiplied by this to derive the ceiling.
    pub average_multiplier: f64,
    /// Weight of the newest sample in the moving average.
    pub statistics_alpha: f64,
    pub probe_timeout_ms: u64,
    pub max_parallel_probes: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            replicas: Vec::new(),
            default_ceiling_ms: 30_000,
            min_wait_ms: 1_000,
            max_wait_ms: 90_000,
            average_multiplier: 1.5,
            statistics_alpha: 0.1,
            probe_timeout_ms: 5_000,
            max_parallel_probes: 8,
        }
    }
}

impl ReplicationSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    fn validate(&self) -> FlowResult<()> {
        if self.min_wait_ms > self.max_wait_ms {
            return Err(FlowError::Config(format!(
                "replication.min_wait_ms ({}) exceeds max_wait_ms ({})",
                self.min_wait_ms, self.max_wait_ms
            )));
        }
        if !(self.average_multiplier.is_finite() && self.average_multiplier > 0.0) {
            return Err(FlowError::Config(
                "replication.average_multiplier must be positive".into(),
            ));
        }
        if !(self.statistics_alpha > 0.0 && self.statistics_alpha <= 1.0) {
            return Err(FlowError::Config(
                "replication.statistics_alpha must be in (0, 1]".into(),
            ));
        }
        if self.max_parallel_probes == 0 {
            return Err(FlowError::Config(
                "replication.max_parallel_probes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
