//! Out-of-band verification progress per channel.

use crate::ids::TokenKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Delivery channel for a verification challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenChannel {
    Email,
    Sms,
}

impl fmt::Display for TokenChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenChannel::Email => write!(f, "EMAIL"),
            TokenChannel::Sms => write!(f, "SMS"),
        }
    }
}

/// A token handed to the user and not yet redeemed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub key: TokenKey,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Which channels were issued and passed for one flow instance.
///
/// `passed` is always a subset of `issued`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenVerificationProgress {
    issued: BTreeSet<TokenChannel>,
    passed: BTreeSet<TokenChannel>,
    active_phase: Option<TokenChannel>,
    outstanding: BTreeMap<TokenChannel, IssuedToken>,
    /// Masked destination shown next to the code entry field.
    pub destination_display: Option<String>,
}

impl TokenVerificationProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_issued(&self, channel: TokenChannel) -> bool {
        self.issued.contains(&channel)
    }

    pub fn is_passed(&self, channel: TokenChannel) -> bool {
        self.passed.contains(&channel)
    }

    pub fn active_phase(&self) -> Option<TokenChannel> {
        self.active_phase
    }

    pub fn issued_channels(&self) -> impl Iterator<Item = TokenChannel> + '_ {
        self.issued.iter().copied()
    }

    pub fn passed_channels(&self) -> impl Iterator<Item = TokenChannel> + '_ {
        self.passed.iter().copied()
    }

    /// The in-flight token for a channel, if one exists and has not expired.
    pub fn outstanding(&self, channel: TokenChannel, now: DateTime<Utc>) -> Option<&IssuedToken> {
        self.outstanding
            .get(&channel)
            .filter(|token| !token.is_expired(now))
    }

    /// Record a freshly issued token and make its channel the active phase.
    pub fn record_issued(&mut self, channel: TokenChannel, token: IssuedToken) {
        self.issued.insert(channel);
        self.outstanding.insert(channel, token);
        self.active_phase = Some(channel);
    }

    /// Record a successful verification.
    pub fn record_passed(&mut self, channel: TokenChannel) {
        self.issued.insert(channel);
        self.passed.insert(channel);
        self.outstanding.remove(&channel);
        if self.active_phase == Some(channel) {
            self.active_phase = None;
        }
        self.destination_display = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(now: DateTime<Utc>) -> IssuedToken {
        IssuedToken {
            key: TokenKey::new("k1"),
            issued_at: now,
            expires_at: now + Duration::minutes(5),
        }
    }

    #[test]
    fn test_issue_sets_active_phase() {
        let now = Utc::now();
        let mut progress = TokenVerificationProgress::new();
        progress.record_issued(TokenChannel::Email, token(now));

        assert!(progress.is_issued(TokenChannel::Email));
        assert!(!progress.is_passed(TokenChannel::Email));
        assert_eq!(progress.active_phase(), Some(TokenChannel::Email));
        assert!(progress.outstanding(TokenChannel::Email, now).is_some());
    }

    #[test]
    fn test_outstanding_ignores_expired_tokens() {
        let now = Utc::now();
        let mut progress = TokenVerificationProgress::new();
        progress.record_issued(TokenChannel::Sms, token(now));
        assert!(progress
            .outstanding(TokenChannel::Sms, now + Duration::minutes(6))
            .is_none());
    }

    #[test]
    fn test_passed_is_subset_of_issued() {
        let mut progress = TokenVerificationProgress::new();
        progress.record_passed(TokenChannel::Sms);
        assert!(progress.is_issued(TokenChannel::Sms));
        assert!(progress
            .passed_channels()
            .all(|c| progress.issued_channels().any(|i| i == c)));
        assert_eq!(progress.active_phase(), None);
    }
}
