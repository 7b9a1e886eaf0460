//! Change-password actions.

use std::sync::Arc;

use async_trait::async_trait;
use credflow_replication::{
    Expectation, ProgressResponse, ReplicaTopology, ReplicationProgressTracker,
};
use credflow_types::{ErrorCode, FlowError, FlowResult, FormData, Gate, PasswordData, StepError};
use tracing::{debug, info, warn};

use super::missing;
use crate::collaborators::WritePayload;
use crate::context::ActionContext;
use crate::dispatcher::{ActionHandler, HaltResponse, Outcome, RedirectTarget};
use crate::session::WorkflowSession;
use crate::step_plan::current_password_required;

/// Poll replication progress. Without a pending change there is nothing
/// to wait for.
pub struct CheckProgress;

#[async_trait]
impl ActionHandler for CheckProgress {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let response = match session.replication.clone() {
            Some(tracker) => tracker.tick_at(&ctx.env.prober, ctx.now).await.response(),
            None => ProgressResponse::finished(),
        };
        Ok(Outcome::Halt(HaltResponse::Progress(response)))
    }
}

/// Acknowledge completion once the change has propagated. With nothing
/// to wait for the flow is simply finished.
pub struct Complete;

#[async_trait]
impl ActionHandler for Complete {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let Some(tracker) = session.replication.clone() else {
            debug!(session_id = %session.id, "Complete without a pending change");
            session.reset();
            return Ok(Outcome::Halt(HaltResponse::Completed));
        };
        let snapshot = tracker.tick_at(&ctx.env.prober, ctx.now).await;
        if !snapshot.complete {
            return Ok(Outcome::Continue);
        }

        let total = snapshot.completion_duration.unwrap_or(snapshot.elapsed);
        ctx.env
            .services
            .statistics
            .record_completion_duration(total);
        info!(
            session_id = %session.id,
            elapsed_ms = total.as_millis() as u64,
            timed_out = snapshot.timed_out,
            "Password change propagation complete"
        );

        session.reset();
        Ok(Outcome::Halt(HaltResponse::Completed))
    }
}

/// Set the new password.
pub struct Change;

#[async_trait]
impl ActionHandler for Change {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        if !session.gates.is_passed(Gate::AllChecks) {
            debug!(session_id = %session.id, "Change requested before all checks passed");
            return Ok(Outcome::Continue);
        }
        if session.replication.is_some() {
            return Err(FlowError::validation(ErrorCode::IncorrectRequestSequence));
        }

        let identity = ctx.identity()?;
        let settings = &ctx.config().change_password;
        let services = &ctx.env.services;

        let passwords = ctx.request.form.as_ref().and_then(new_password_pair);
        let Some((password, confirm)) = passwords else {
            session.fail(missing("password"));
            return Ok(Outcome::Continue);
        };

        if let Some(policy) = &services.password_policy {
            if let Err(rule) = policy.check(Some(identity), &password) {
                debug!(session_id = %session.id, rule = %rule, "New password rejected by policy");
                session.fail(StepError::validation(ErrorCode::PasswordPolicy).with_detail(rule));
                return Ok(Outcome::Continue);
            }
        }
        if !password.matches(&confirm, settings.case_sensitive) {
            session.fail(StepError::validation(ErrorCode::PasswordMismatch));
            return Ok(Outcome::Continue);
        }

        let write = services
            .writer
            .perform_write(identity, WritePayload::SetPassword(password.clone()))
            .await;
        if let Err(e) = write {
            warn!(session_id = %session.id, error = %e, "Password write failed");
            session.fail(StepError::validation(ErrorCode::WriteFailed).with_detail(e.to_string()));
            return Ok(Outcome::Continue);
        }

        let ceiling = ctx
            .env
            .ceiling_policy
            .compute(services.statistics.as_ref());
        let topology = ReplicaTopology::from_endpoints(ctx.config().replication.replicas.clone());
        let tracker = ReplicationProgressTracker::start(
            identity.clone(),
            Expectation::CredentialAccepted {
                credential: password,
            },
            topology,
            ceiling,
            ctx.now,
        );
        session.replication = Some(Arc::new(tracker));
        session.subject.requires_new_password = false;

        info!(session_id = %session.id, identity = %identity, "Password changed");
        Ok(Outcome::Continue)
    }
}

/// Verify the current password and the required form values.
pub struct Form;

#[async_trait]
impl ActionHandler for Form {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let identity = ctx.identity()?;
        let settings = &ctx.config().change_password;
        let verifier = &ctx.env.services.verifier;

        if current_password_required(settings.require_current_password, &session.subject)
            && !session.gates.is_passed(Gate::CurrentPassword)
        {
            let Some(current) = ctx.param("currentPassword") else {
                session.fail(missing("currentPassword"));
                return Ok(Outcome::Continue);
            };
            let accepted = verifier
                .verify_current_password(identity, &PasswordData::new(current))
                .await?;
            if !accepted {
                warn!(session_id = %session.id, identity = %identity, "Current password incorrect");
                session.fail(StepError::validation(ErrorCode::BadCurrentPassword));
                return Ok(Outcome::Continue);
            }
            session.gates.mark(Gate::CurrentPassword);
        }

        if !settings.required_form.is_empty() {
            let submitted = ctx.request.form.clone().unwrap_or_default();
            let mut values = FormData::new();
            for field in &settings.required_form {
                match submitted.field(&field.name) {
                    Some(value) => values = values.with_field(field.name.as_str(), value),
                    None if field.required => {
                        session.fail(missing(&field.name));
                        return Ok(Outcome::Continue);
                    }
                    None => {}
                }
            }

            let mismatched = verifier.compare_attributes(identity, &values).await?;
            if !mismatched.is_empty() {
                warn!(
                    session_id = %session.id,
                    identity = %identity,
                    fields = mismatched.len(),
                    "Form values do not match directory"
                );
                session.fail(
                    StepError::validation(ErrorCode::IncorrectResponse)
                        .with_detail(mismatched.join(", ")),
                );
                return Ok(Outcome::Continue);
            }
        }

        session.gates.mark(Gate::Form);
        Ok(Outcome::Continue)
    }
}

/// Answer the expiry warning: `skip` leaves the flow, `change` proceeds.
pub struct WarnResponse;

#[async_trait]
impl ActionHandler for WarnResponse {
    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        if !session.subject.password_status.warn_period {
            return Ok(Outcome::Continue);
        }
        let answer = ctx.param("warnResponse").map(str::to_ascii_lowercase);
        match answer.as_deref() {
            Some("skip") => {
                session.subject.skip_new_password = true;
                return Ok(Outcome::Halt(HaltResponse::Redirect {
                    target: RedirectTarget::Continue,
                    unauthenticate: false,
                }));
            }
            Some("change") => {
                session.gates.mark(Gate::Warn);
            }
            _ => {}
        }
        Ok(Outcome::Continue)
    }
}

/// Abandon the flow. A user forced here to pick a new password arrived
/// with a temporary authentication, which must not outlive the flow.
pub struct Reset;

#[async_trait]
impl ActionHandler for Reset {
    async fn execute(
        &self,
        _ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome> {
        let unauthenticate = session.subject.requires_new_password;
        session.reset();
        Ok(Outcome::Halt(HaltResponse::Redirect {
            target: RedirectTarget::Home,
            unauthenticate,
        }))
    }
}

fn new_password_pair(form: &FormData) -> Option<(PasswordData, PasswordData)> {
    let password = form.password.clone().filter(|p| !p.is_empty())?;
    let confirm = form.confirm_password.clone()?;
    Some((password, confirm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Services;
    use crate::context::FlowEnvironment;
    use crate::dispatcher::{ActionDispatcher, ActionId, ActionRequest};
    use crate::memory::{DirectoryEntry, MemoryDirectory, MemoryTokenIssuer, RecordingDelivery};
    use chrono::Utc;
    use credflow_replication::{CompletionStatistics, EwmaCompletionStatistics};
    use credflow_types::{
        AuthContext, ChangePasswordSettings, FlowConfig, FlowKind, FormField, PasswordStatus,
        Permission, RequireCurrentPasswordMode, SubjectState, UserIdentity,
    };
    use std::collections::BTreeMap;

    struct Fixture {
        env: FlowEnvironment,
        directory: Arc<MemoryDirectory>,
        statistics: Arc<EwmaCompletionStatistics>,
        dispatcher: ActionDispatcher,
        auth: AuthContext,
    }

    impl Fixture {
        fn new(settings: ChangePasswordSettings) -> Self {
            let directory = Arc::new(MemoryDirectory::new().with_auto_propagate());
            let mut attributes = BTreeMap::new();
            attributes.insert("mail".to_string(), "ann@example.com".to_string());
            directory.add_entry(
                ann(),
                DirectoryEntry {
                    password: Some(PasswordData::new("old-secret")),
                    attributes,
                },
            );
            let statistics = Arc::new(EwmaCompletionStatistics::new(0.5));
            let services = Services::new(
                directory.clone(),
                directory.clone(),
                directory.clone(),
                Arc::new(RecordingDelivery::new()),
                Arc::new(MemoryTokenIssuer::new()),
                statistics.clone(),
            );
            let config = FlowConfig {
                change_password: settings,
                ..Default::default()
            };
            Self {
                env: FlowEnvironment::new(config, services).unwrap(),
                directory,
                statistics,
                dispatcher: ActionDispatcher::default(),
                auth: AuthContext::authenticated(ann()).with_permission(Permission::ChangePassword),
            }
        }

        async fn send(
            &self,
            session: &mut WorkflowSession,
            request: ActionRequest,
        ) -> FlowResult<Outcome> {
            let request = request.bound_to(session);
            self.dispatcher
                .dispatch(&self.env, &self.auth, &request, session, Utc::now())
                .await
        }
    }

    fn ann() -> UserIdentity {
        UserIdentity::new("uid=ann")
    }

    fn session(subject: SubjectState) -> WorkflowSession {
        WorkflowSession::new(FlowKind::ChangePassword, subject)
    }

    fn new_password(password: &str, confirm: &str) -> FormData {
        FormData::new().with_passwords(PasswordData::new(password), PasswordData::new(confirm))
    }

    #[tokio::test]
    async fn test_change_before_checks_is_ignored() {
        let fx = Fixture::new(ChangePasswordSettings::default());
        let mut session = session(SubjectState::default());
        let request = ActionRequest::post(ActionId::Change).with_form(new_password("n3w", "n3w"));

        assert_eq!(fx.send(&mut session, request).await.unwrap(), Outcome::Continue);
        assert!(session.replication.is_none());
        assert_eq!(fx.directory.write_count(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_confirmation_records_error() {
        let fx = Fixture::new(ChangePasswordSettings::default());
        let mut session = session(SubjectState::default());
        session.gates.mark(Gate::AllChecks);
        let request = ActionRequest::post(ActionId::Change).with_form(new_password("n3w", "N3W"));

        fx.send(&mut session, request).await.unwrap();
        assert_eq!(
            session.last_error.as_ref().map(|e| e.code),
            Some(ErrorCode::PasswordMismatch)
        );
        assert!(session.replication.is_none());
    }

    #[tokio::test]
    async fn test_change_starts_tracker_and_complete_feeds_statistics() {
        let fx = Fixture::new(ChangePasswordSettings::default());
        let mut session = session(SubjectState::default());
        session.gates.mark(Gate::AllChecks);

        let request = ActionRequest::post(ActionId::Change).with_form(new_password("n3w", "n3w"));
        fx.send(&mut session, request).await.unwrap();
        assert!(session.replication.is_some());
        assert_eq!(
            fx.directory.entry(&ann()).unwrap().password,
            Some(PasswordData::new("n3w"))
        );

        // Unknown topology: nothing completes before the ceiling passes.
        let outcome = fx
            .send(&mut session, ActionRequest::get(ActionId::Complete))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Continue);
        assert!(session.replication.is_some());

        let tracker = session.replication.clone().unwrap();
        let late = tracker.max_completion_deadline() + chrono::Duration::milliseconds(1);
        let request = ActionRequest::get(ActionId::Complete).bound_to(&session);
        let outcome = fx
            .dispatcher
            .dispatch(&fx.env, &fx.auth, &request, &mut session, late)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Halt(HaltResponse::Completed));
        assert!(session.replication.is_none());
        assert_eq!(fx.statistics.sample_count(), 1);
        assert!(fx.statistics.average_completion_duration().is_some());
    }

    #[tokio::test]
    async fn test_complete_without_change_finishes_and_clears() {
        let fx = Fixture::new(ChangePasswordSettings::default());
        let mut session = session(SubjectState::default());
        session.gates.mark(Gate::AllChecks);

        let outcome = fx
            .send(&mut session, ActionRequest::get(ActionId::Complete))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Halt(HaltResponse::Completed));
        assert!(!session.gates.is_passed(Gate::AllChecks));
        assert_eq!(fx.statistics.sample_count(), 0);
    }

    #[tokio::test]
    async fn test_check_progress_without_tracker_reports_finished() {
        let fx = Fixture::new(ChangePasswordSettings::default());
        let mut session = session(SubjectState::default());
        let outcome = fx
            .send(&mut session, ActionRequest::post(ActionId::CheckProgress))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Halt(HaltResponse::Progress(ProgressResponse::finished()))
        );
        assert_eq!(session.binding.sequence, 0);
    }

    #[tokio::test]
    async fn test_form_checks_current_password_then_attributes() {
        let fx = Fixture::new(ChangePasswordSettings {
            require_current_password: RequireCurrentPasswordMode::True,
            required_form: vec![FormField::required("mail")],
            ..Default::default()
        });
        let mut session = session(SubjectState::default().with_current_password_known(true));

        let request = ActionRequest::post(ActionId::Form).with_param("currentPassword", "wrong");
        fx.send(&mut session, request).await.unwrap();
        assert_eq!(
            session.last_error.take().map(|e| e.code),
            Some(ErrorCode::BadCurrentPassword)
        );
        assert!(!session.gates.is_passed(Gate::CurrentPassword));

        let request = ActionRequest::post(ActionId::Form)
            .with_param("currentPassword", "old-secret")
            .with_form(FormData::new().with_field("mail", "eve@example.com"));
        fx.send(&mut session, request).await.unwrap();
        assert!(session.gates.is_passed(Gate::CurrentPassword));
        assert!(!session.gates.is_passed(Gate::Form));
        let err = session.last_error.take().unwrap();
        assert_eq!(err.code, ErrorCode::IncorrectResponse);
        assert_eq!(err.detail.as_deref(), Some("mail"));

        let request = ActionRequest::post(ActionId::Form)
            .with_form(FormData::new().with_field("mail", "ann@example.com"));
        fx.send(&mut session, request).await.unwrap();
        assert!(session.gates.is_passed(Gate::Form));
        assert!(session.last_error.is_none());
    }

    #[tokio::test]
    async fn test_warn_response_skip_and_change() {
        let fx = Fixture::new(ChangePasswordSettings::default());
        let warned = SubjectState::default().with_password_status(PasswordStatus {
            warn_period: true,
            ..Default::default()
        });

        let mut session_a = session(warned.clone());
        let outcome = fx
            .send(
                &mut session_a,
                ActionRequest::post(ActionId::WarnResponse).with_param("warnResponse", "Skip"),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Halt(HaltResponse::Redirect {
                target: RedirectTarget::Continue,
                ..
            })
        ));
        assert!(session_a.subject.skip_new_password);

        let mut session_b = session(warned);
        fx.send(
            &mut session_b,
            ActionRequest::post(ActionId::WarnResponse).with_param("warnResponse", "change"),
        )
        .await
        .unwrap();
        assert!(session_b.gates.is_passed(Gate::Warn));
    }

    #[tokio::test]
    async fn test_reset_unauthenticates_forced_change() {
        let fx = Fixture::new(ChangePasswordSettings::default());
        let mut subject = SubjectState::default();
        subject.requires_new_password = true;
        let mut session = session(subject);
        session.gates.mark(Gate::Agreement);

        let outcome = fx
            .send(&mut session, ActionRequest::post(ActionId::Reset))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Halt(HaltResponse::Redirect {
                target: RedirectTarget::Home,
                unauthenticate: true,
            })
        );
        assert!(!session.gates.is_passed(Gate::Agreement));
    }
}
