//! Token verification tracker.
//!
//! Issues out-of-band challenges and checks the codes users type back in.
//! A token is bound to the form data of the session it was issued for; a
//! code presented to a session holding different data is rejected.

use std::fmt;

use chrono::{DateTime, Utc};
use credflow_types::{FlowResult, Gate, IssuedToken, TokenChannel, TokenKey, TokenSettings};
use tracing::{info, instrument, warn};

use crate::collaborators::{ChallengeDelivery, TokenIssuer, TokenPayload};
use crate::session::WorkflowSession;

/// Why a code was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    InvalidCode,
    WrongChannel,
    Expired,
    MismatchedSession,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyFailure::InvalidCode => write!(f, "invalid code"),
            VerifyFailure::WrongChannel => write!(f, "code was issued for another channel"),
            VerifyFailure::Expired => write!(f, "code has expired"),
            VerifyFailure::MismatchedSession => write!(f, "mismatched session"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Passed,
    Failed(VerifyFailure),
}

pub struct TokenVerificationTracker<'a> {
    issuer: &'a dyn TokenIssuer,
    delivery: &'a dyn ChallengeDelivery,
    settings: &'a TokenSettings,
}

impl<'a> TokenVerificationTracker<'a> {
    pub fn new(
        issuer: &'a dyn TokenIssuer,
        delivery: &'a dyn ChallengeDelivery,
        settings: &'a TokenSettings,
    ) -> Self {
        Self {
            issuer,
            delivery,
            settings,
        }
    }

    /// Issue a challenge on `channel` unless an unexpired one is already
    /// in flight, in which case its key is returned and nothing is sent.
    #[instrument(skip(self, session, destination), fields(session_id = %session.id))]
    pub async fn issue(
        &self,
        session: &mut WorkflowSession,
        channel: TokenChannel,
        destination: &str,
        now: DateTime<Utc>,
    ) -> FlowResult<TokenKey> {
        if let Some(token) = session.token_progress.outstanding(channel, now) {
            return Ok(token.key.clone());
        }
        self.send(session, channel, destination, now).await
    }

    /// Issue a fresh challenge even if one is in flight.
    pub async fn reissue(
        &self,
        session: &mut WorkflowSession,
        channel: TokenChannel,
        destination: &str,
        now: DateTime<Utc>,
    ) -> FlowResult<TokenKey> {
        if let Some(previous) = session.token_progress.outstanding(channel, now) {
            let key = previous.key.clone();
            if let Err(e) = self.issuer.revoke(&key).await {
                warn!(
                    session_id = %session.id,
                    channel = %channel,
                    error = %e,
                    "Failed to revoke previous token"
                );
            }
        }
        self.send(session, channel, destination, now).await
    }

    #[instrument(skip(self, session, code), fields(session_id = %session.id))]
    pub async fn verify(
        &self,
        session: &mut WorkflowSession,
        channel: TokenChannel,
        code: &str,
        now: DateTime<Utc>,
    ) -> FlowResult<VerifyOutcome> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(VerifyOutcome::Failed(VerifyFailure::InvalidCode));
        }
        let Some(payload) = self.issuer.redeem(code).await? else {
            return Ok(self.reject(session, channel, VerifyFailure::InvalidCode));
        };
        if payload.channel != channel {
            return Ok(self.reject(session, channel, VerifyFailure::WrongChannel));
        }
        if now >= payload.expires_at {
            return Ok(self.reject(session, channel, VerifyFailure::Expired));
        }
        if let (Some(current), Some(bound)) = (session.profile_id(), payload.profile.as_ref()) {
            if current != bound {
                return Ok(self.reject(session, channel, VerifyFailure::MismatchedSession));
            }
        }

        let restored = match (&session.form, &payload.form) {
            (Some(current), Some(bound)) if current.is_consistent_with(bound) => None,
            // An emailed link opened in a fresh browser carries the whole
            // registration with it.
            (None, Some(bound)) if channel == TokenChannel::Email => Some(bound.clone()),
            _ => return Ok(self.reject(session, channel, VerifyFailure::MismatchedSession)),
        };
        if let Some(form) = restored {
            session.form = Some(form);
            session.gates.mark(Gate::Form);
            if let Some(profile) = payload.profile {
                session.select_profile(profile)?;
            }
            info!(session_id = %session.id, "Registration restored from email token");
        }

        session.token_progress.record_passed(channel);
        let key = TokenKey::new(code);
        if let Err(e) = self.issuer.revoke(&key).await {
            warn!(
                session_id = %session.id,
                channel = %channel,
                error = %e,
                "Failed to revoke redeemed token"
            );
        }
        info!(session_id = %session.id, channel = %channel, "Verification token passed");
        Ok(VerifyOutcome::Passed)
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn send(
        &self,
        session: &mut WorkflowSession,
        channel: TokenChannel,
        destination: &str,
        now: DateTime<Utc>,
    ) -> FlowResult<TokenKey> {
        let lifetime = self.settings.lifetime();
        let expires_at = self.settings.expiry_after(now)?;
        let payload = TokenPayload {
            channel,
            session: session.id,
            profile: session.profile_id().cloned(),
            form: session.form.clone(),
            expires_at,
        };

        let key = self.issuer.create_token(payload, lifetime).await?;
        self.delivery.send_challenge(channel, destination, &key).await?;

        session.token_progress.record_issued(
            channel,
            IssuedToken {
                key: key.clone(),
                issued_at: now,
                expires_at,
            },
        );
        session.token_progress.destination_display = Some(mask_destination(destination));
        info!(session_id = %session.id, channel = %channel, "Verification token issued");
        Ok(key)
    }

    fn reject(
        &self,
        session: &WorkflowSession,
        channel: TokenChannel,
        failure: VerifyFailure,
    ) -> VerifyOutcome {
        warn!(
            session_id = %session.id,
            channel = %channel,
            reason = %failure,
            "Verification token rejected"
        );
        VerifyOutcome::Failed(failure)
    }
}

/// Show only enough of a destination for the user to recognise it.
fn mask_destination(destination: &str) -> String {
    match destination.split_once('@') {
        Some((local, domain)) => {
            let head: String = local.chars().take(1).collect();
            format!("{}***@{}", head, domain)
        }
        None => {
            let chars: Vec<char> = destination.chars().collect();
            let tail: String = chars[chars.len().saturating_sub(2)..].iter().collect();
            format!("***{}", tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryTokenIssuer, RecordingDelivery};
    use credflow_types::{FlowKind, FormData, PasswordData, ProfileId, SubjectState};

    fn form(mail: &str) -> FormData {
        FormData::new()
            .with_field("cn", "ann")
            .with_field("mail", mail)
            .with_passwords(PasswordData::new("pw1"), PasswordData::new("pw1"))
    }

    fn session_with(form_data: Option<FormData>) -> WorkflowSession {
        let mut session = WorkflowSession::new(FlowKind::NewUser, SubjectState::registration());
        session.select_profile(ProfileId::new("staff")).unwrap();
        session.form = form_data;
        session
    }

    #[tokio::test]
    async fn test_issue_is_idempotent() {
        let issuer = MemoryTokenIssuer::new();
        let delivery = RecordingDelivery::new();
        let settings = TokenSettings::default();
        let tracker = TokenVerificationTracker::new(&issuer, &delivery, &settings);
        let mut session = session_with(Some(form("ann@example.com")));
        let now = Utc::now();

        let first = tracker
            .issue(&mut session, TokenChannel::Email, "ann@example.com", now)
            .await
            .unwrap();
        let second = tracker
            .issue(&mut session, TokenChannel::Email, "ann@example.com", now)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(delivery.sent().len(), 1);
        assert_eq!(session.token_progress.active_phase(), Some(TokenChannel::Email));
        assert_eq!(
            session.token_progress.destination_display.as_deref(),
            Some("a***@example.com")
        );
    }

    #[tokio::test]
    async fn test_reissue_sends_new_token() {
        let issuer = MemoryTokenIssuer::new();
        let delivery = RecordingDelivery::new();
        let settings = TokenSettings::default();
        let tracker = TokenVerificationTracker::new(&issuer, &delivery, &settings);
        let mut session = session_with(Some(form("ann@example.com")));
        let now = Utc::now();

        let first = tracker
            .issue(&mut session, TokenChannel::Sms, "+15550001234", now)
            .await
            .unwrap();
        let second = tracker
            .reissue(&mut session, TokenChannel::Sms, "+15550001234", now)
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(delivery.sent().len(), 2);
        assert_eq!(issuer.redeem(first.as_str()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_verify_passes_matching_session() {
        let issuer = MemoryTokenIssuer::new();
        let delivery = RecordingDelivery::new();
        let settings = TokenSettings::default();
        let tracker = TokenVerificationTracker::new(&issuer, &delivery, &settings);
        let mut session = session_with(Some(form("ann@example.com")));
        let now = Utc::now();

        let key = tracker
            .issue(&mut session, TokenChannel::Email, "ann@example.com", now)
            .await
            .unwrap();
        let outcome = tracker
            .verify(&mut session, TokenChannel::Email, key.as_str(), now)
            .await
            .unwrap();

        assert_eq!(outcome, VerifyOutcome::Passed);
        assert!(session.token_progress.is_passed(TokenChannel::Email));
        assert_eq!(session.token_progress.active_phase(), None);
    }

    #[tokio::test]
    async fn test_verify_rejects_mismatched_form() {
        let issuer = MemoryTokenIssuer::new();
        let delivery = RecordingDelivery::new();
        let settings = TokenSettings::default();
        let tracker = TokenVerificationTracker::new(&issuer, &delivery, &settings);
        let now = Utc::now();

        let mut issued_for_a = session_with(Some(form("a@example.com")));
        let key = tracker
            .issue(&mut issued_for_a, TokenChannel::Sms, "+15550001234", now)
            .await
            .unwrap();

        let mut holding_b = session_with(Some(form("b@example.com")));
        let outcome = tracker
            .verify(&mut holding_b, TokenChannel::Sms, key.as_str(), now)
            .await
            .unwrap();

        assert_eq!(outcome, VerifyOutcome::Failed(VerifyFailure::MismatchedSession));
        assert_eq!(VerifyFailure::MismatchedSession.to_string(), "mismatched session");
        assert!(!holding_b.token_progress.is_passed(TokenChannel::Sms));
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_wrong_channel_and_expired() {
        let issuer = MemoryTokenIssuer::new();
        let delivery = RecordingDelivery::new();
        let settings = TokenSettings { lifetime_secs: 60 };
        let tracker = TokenVerificationTracker::new(&issuer, &delivery, &settings);
        let mut session = session_with(Some(form("ann@example.com")));
        let now = Utc::now();

        let unknown = tracker
            .verify(&mut session, TokenChannel::Email, "nope", now)
            .await
            .unwrap();
        assert_eq!(unknown, VerifyOutcome::Failed(VerifyFailure::InvalidCode));

        let key = tracker
            .issue(&mut session, TokenChannel::Email, "ann@example.com", now)
            .await
            .unwrap();
        let wrong = tracker
            .verify(&mut session, TokenChannel::Sms, key.as_str(), now)
            .await
            .unwrap();
        assert_eq!(wrong, VerifyOutcome::Failed(VerifyFailure::WrongChannel));

        let late = now + chrono::Duration::seconds(61);
        let expired = tracker
            .verify(&mut session, TokenChannel::Email, key.as_str(), late)
            .await
            .unwrap();
        assert_eq!(expired, VerifyOutcome::Failed(VerifyFailure::Expired));
    }

    #[tokio::test]
    async fn test_email_token_restores_registration_in_fresh_session() {
        let issuer = MemoryTokenIssuer::new();
        let delivery = RecordingDelivery::new();
        let settings = TokenSettings::default();
        let tracker = TokenVerificationTracker::new(&issuer, &delivery, &settings);
        let now = Utc::now();

        let mut original = session_with(Some(form("ann@example.com")));
        let key = tracker
            .issue(&mut original, TokenChannel::Email, "ann@example.com", now)
            .await
            .unwrap();

        let mut fresh = WorkflowSession::new(FlowKind::NewUser, SubjectState::registration());
        let outcome = tracker
            .verify(&mut fresh, TokenChannel::Email, key.as_str(), now)
            .await
            .unwrap();

        assert_eq!(outcome, VerifyOutcome::Passed);
        assert_eq!(fresh.form, Some(form("ann@example.com")));
        assert!(fresh.gates.is_passed(Gate::Form));
        assert_eq!(fresh.profile_id(), Some(&ProfileId::new("staff")));
    }

    #[test]
    fn test_mask_destination() {
        assert_eq!(mask_destination("ann@example.com"), "a***@example.com");
        assert_eq!(mask_destination("+15550001234"), "***34");
        assert_eq!(mask_destination("7"), "***7");
    }
}
