//! Action handlers for the built-in flows.
//!
//! Handlers report user mistakes by recording a [`StepError`] on the
//! session and returning [`Outcome::Continue`]; the error is then shown
//! with the next resolved step. Returning `Err` rejects the request and
//! discards every change the handler made.

pub mod change_password;
pub mod new_user;

use async_trait::async_trait;
use credflow_types::{
    ErrorCode, FlowResult, FormData, Gate, NewUserProfile, StepError, TokenChannel,
};
use tracing::info;

use crate::collaborators::Services;
use crate::context::ActionContext;
use crate::dispatcher::{ActionHandler, Outcome};
use crate::session::WorkflowSession;
use crate::token_tracker::VerifyFailure;

/// Accept the configured agreement text. Shared by both flows.
pub struct Agree;

#[async_trait]
impl ActionHandler for Agree {
    async fn execute(
        &self,
        _ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        if session.gates.mark(Gate::Agreement) {
            info!(session_id = %session.id, flow = %session.flow, "Agreement accepted");
        }
        Ok(Outcome::Continue)
    }
}

// ── Internal helpers ────────────────────────────────────────────

pub(crate) fn missing(name: &str) -> StepError {
    StepError::validation(ErrorCode::MissingParameter).with_detail(name)
}

/// Check a registration form against its profile and the password rules.
pub(crate) fn verify_registration(
    services: &Services,
    profile: &NewUserProfile,
    form: &FormData,
) -> Result<(), StepError> {
    for field in profile.form.iter().filter(|f| f.required) {
        if form.field(&field.name).is_none() {
            return Err(missing(&field.name));
        }
    }
    if form.field(&profile.naming_field).is_none() {
        return Err(missing(&profile.naming_field));
    }
    if profile.email_verification && form.field(&profile.email_field).is_none() {
        return Err(missing(&profile.email_field));
    }
    if profile.sms_verification && form.field(&profile.phone_field).is_none() {
        return Err(missing(&profile.phone_field));
    }

    let password = form
        .password
        .as_ref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| missing("password"))?;
    let confirm = form
        .confirm_password
        .as_ref()
        .ok_or_else(|| missing("confirm_password"))?;

    if let Some(policy) = &services.password_policy {
        policy
            .check(None, password)
            .map_err(|rule| StepError::validation(ErrorCode::PasswordPolicy).with_detail(rule))?;
    }
    if !password.matches(confirm, true) {
        return Err(StepError::validation(ErrorCode::PasswordMismatch));
    }
    Ok(())
}

pub(crate) fn verify_failure_error(channel: TokenChannel, failure: VerifyFailure) -> StepError {
    let code = match failure {
        VerifyFailure::InvalidCode | VerifyFailure::WrongChannel => ErrorCode::TokenIncorrect,
        VerifyFailure::Expired => ErrorCode::TokenExpired,
        VerifyFailure::MismatchedSession => ErrorCode::TokenMismatchedSession,
    };
    StepError::validation(code).with_detail(format!("{} token: {}", channel, failure))
}
