//! New-user registration actions, plus the account creation and token
//! issuance the orchestrator performs while advancing a registration.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credflow_replication::{Ceiling, Expectation, ReplicaTopology, ReplicationProgressTracker};
use credflow_types::{
    ErrorCode, FlowError, FlowResult, Gate, NewUserProfile, ProfileId, StepError, TokenChannel,
    UserIdentity,
};
use tracing::{debug, error, info, warn};

use super::{missing, verify_failure_error, verify_registration};
use crate::collaborators::WritePayload;
use crate::context::{ActionContext, FlowEnvironment};
use crate::dispatcher::{
    ActionHandler, ActionRequest, FormValidationResponse, HaltResponse, Outcome,
};
use crate::session::WorkflowSession;
use crate::token_tracker::{TokenVerificationTracker, VerifyOutcome};

/// Pick one of several configured profiles. Unknown ids are ignored.
pub struct ProfileChoice;

#[async_trait]
impl ActionHandler for ProfileChoice {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let Some(requested) = ctx.param("profile") else {
            return Ok(Outcome::Continue);
        };
        let id = ProfileId::new(requested);
        if ctx.config().new_user.profile(&id).is_none() {
            debug!(session_id = %session.id, profile = %id, "Ignoring unknown profile choice");
            return Ok(Outcome::Continue);
        }
        session.select_profile(id)?;
        Ok(Outcome::Continue)
    }
}

/// Poll the wait that follows account creation.
pub struct CheckProgress;

#[async_trait]
impl ActionHandler for CheckProgress {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let tracker = session
            .replication
            .clone()
            .ok_or_else(|| FlowError::validation(ErrorCode::IncorrectRequestSequence))?;
        let snapshot = tracker.tick_at(&ctx.env.prober, ctx.now).await;
        Ok(Outcome::Halt(HaltResponse::Progress(snapshot.response())))
    }
}

/// Acknowledge the finished registration once the wait is over.
pub struct Complete;

#[async_trait]
impl ActionHandler for Complete {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let tracker = session
            .replication
            .clone()
            .ok_or_else(|| FlowError::validation(ErrorCode::IncorrectRequestSequence))?;
        if !tracker.tick_at(&ctx.env.prober, ctx.now).await.complete {
            return Ok(Outcome::Continue);
        }
        info!(session_id = %session.id, identity = %tracker.identity(), "Registration complete");
        session.reset();
        Ok(Outcome::Halt(HaltResponse::Completed))
    }
}

/// Submit the registration form.
pub struct ProcessForm;

#[async_trait]
impl ActionHandler for ProcessForm {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let services = &ctx.env.services;
        if let Some(captcha) = &services.captcha {
            if !captcha.verify(ctx.param("captchaResponse")).await? {
                debug!(session_id = %session.id, "Captcha rejected");
                session.fail(StepError::validation(ErrorCode::BadCaptcha));
                return Ok(Outcome::Continue);
            }
        }

        let profile = selected_profile(ctx.env, session)?;
        if session.gates.is_passed(Gate::Form) {
            session.fail(StepError::validation(ErrorCode::IncorrectRequestSequence));
            return Ok(Outcome::Continue);
        }
        let Some(form) = ctx.request.form.clone() else {
            session.fail(missing("form"));
            return Ok(Outcome::Continue);
        };
        if let Err(e) = verify_registration(services, profile, &form) {
            debug!(session_id = %session.id, error = %e, "Registration form rejected");
            session.fail(e);
            return Ok(Outcome::Continue);
        }

        session.form = Some(form);
        session.gates.mark(Gate::Form);
        info!(session_id = %session.id, "Registration form accepted");
        Ok(Outcome::Continue)
    }
}

/// Check a form as the user types, without storing anything.
pub struct Validate;

#[async_trait]
impl ActionHandler for Validate {
    fn validate(&self, request: &ActionRequest) -> FlowResult<()> {
        if request.form.is_none() {
            return Err(FlowError::Validation(missing("form")));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let profile = selected_profile(ctx.env, session)?;
        let form = ctx
            .request
            .form
            .as_ref()
            .ok_or_else(|| FlowError::Validation(missing("form")))?;
        let response = match verify_registration(&ctx.env.services, profile, form) {
            Ok(()) => FormValidationResponse {
                passed: true,
                message: None,
            },
            Err(e) => FormValidationResponse {
                passed: false,
                message: Some(e.to_string()),
            },
        };
        Ok(Outcome::Halt(HaltResponse::FormValidation(response)))
    }
}

/// Redeem a verification code.
///
/// A session with no form data and no challenge in flight is taken to be
/// an emailed link opened on another device.
pub struct EnterCode;

#[async_trait]
impl ActionHandler for EnterCode {
    fn validate(&self, request: &ActionRequest) -> FlowResult<()> {
        if request.param("code").is_none() {
            return Err(FlowError::Validation(missing("code")));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let code = ctx.param("code").unwrap_or_default();
        let channel = match session.token_progress.active_phase() {
            Some(channel) => channel,
            None if session.form.is_none() => TokenChannel::Email,
            None => {
                session.fail(StepError::validation(ErrorCode::IncorrectRequestSequence));
                return Ok(Outcome::Continue);
            }
        };

        let services = &ctx.env.services;
        let tracker = TokenVerificationTracker::new(
            services.tokens.as_ref(),
            services.delivery.as_ref(),
            &ctx.config().tokens,
        );
        if let VerifyOutcome::Failed(failure) =
            tracker.verify(session, channel, code, ctx.now).await?
        {
            session.fail(verify_failure_error(channel, failure));
        }
        Ok(Outcome::Continue)
    }
}

/// Throw away the registration and start over.
pub struct Reset;

#[async_trait]
impl ActionHandler for Reset {
    async fn execute(
        &self,
        _ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        session.reset();
        Ok(Outcome::Halt(HaltResponse::SessionReset))
    }
}

// ── Orchestrator steps ──────────────────────────────────────────

fn selected_profile<'a>(
    env: &'a FlowEnvironment,
    session: &WorkflowSession,
) -> FlowResult<&'a NewUserProfile> {
    let id = session
        .profile_id()
        .ok_or_else(|| FlowError::validation(ErrorCode::IncorrectRequestSequence))?;
    env.config
        .new_user
        .profile(id)
        .ok_or_else(|| FlowError::Config(format!("session refers to unknown {}", id)))
}

/// Send the challenge for `channel` to the address on the form.
pub(crate) async fn issue_token(
    env: &FlowEnvironment,
    session: &mut WorkflowSession,
    channel: TokenChannel,
    now: DateTime<Utc>,
    force: bool,
) -> FlowResult<()> {
    let profile = selected_profile(env, session)?;
    let field = match channel {
        TokenChannel::Email => &profile.email_field,
        TokenChannel::Sms => &profile.phone_field,
    };
    let destination = session
        .form
        .as_ref()
        .and_then(|form| form.field(field))
        .map(str::to_string)
        .ok_or_else(|| FlowError::Validation(missing(field)))?;

    let tracker = TokenVerificationTracker::new(
        env.services.tokens.as_ref(),
        env.services.delivery.as_ref(),
        &env.config.tokens,
    );
    if force {
        tracker.reissue(session, channel, &destination, now).await?;
    } else {
        tracker.issue(session, channel, &destination, now).await?;
    }
    Ok(())
}

/// Create the directory entry for a registration whose gates have all
/// passed, then start the minimum wait before it may be used. A failed
/// write is recorded on the session and ends the registration.
pub(crate) async fn create_account(
    env: &FlowEnvironment,
    session: &mut WorkflowSession,
    now: DateTime<Utc>,
) -> FlowResult<()> {
    let profile = selected_profile(env, session)?;
    let form = session
        .form
        .clone()
        .ok_or_else(|| FlowError::validation(ErrorCode::IncorrectRequestSequence))?;
    verify_registration(&env.services, profile, &form).map_err(FlowError::Validation)?;
    let identity = form
        .field(&profile.naming_field)
        .map(UserIdentity::new)
        .ok_or_else(|| FlowError::Validation(missing(&profile.naming_field)))?;

    if let Err(e) = env
        .services
        .writer
        .perform_write(&identity, WritePayload::CreateEntry(form))
        .await
    {
        error!(
            session_id = %session.id,
            identity = %identity,
            error = %e,
            "Account creation failed"
        );
        if profile.delete_on_fail {
            remove_partial_entry(env, session, &identity).await;
        }
        session.write_failed = true;
        session.fail(StepError::validation(ErrorCode::WriteFailed).with_detail(e.to_string()));
        return Ok(());
    }

    let tracker = ReplicationProgressTracker::start(
        identity.clone(),
        Expectation::EntryPresent,
        ReplicaTopology::Unknown,
        Ceiling::fixed(profile.minimum_wait()),
        now,
    );
    session.replication = Some(Arc::new(tracker));
    info!(session_id = %session.id, identity = %identity, "Account created");
    Ok(())
}

async fn remove_partial_entry(
    env: &FlowEnvironment,
    session: &WorkflowSession,
    identity: &UserIdentity,
) {
    match env
        .services
        .writer
        .perform_write(identity, WritePayload::DeleteEntry)
        .await
    {
        Ok(()) => warn!(
            session_id = %session.id,
            identity = %identity,
            "Deleted partially created account"
        ),
        Err(e) => error!(
            session_id = %session.id,
            identity = %identity,
            error = %e,
            "Failed to delete partially created account"
        ),
    }
}
