//! End-to-end registration flows driven through `FlowService`.
//!
//! Covers profile selection, form checks, email and SMS verification
//! (including a link opened on another device), account creation and the
//! minimum wait before completion.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use credflow_engine::memory::{MemoryDirectory, MemoryTokenIssuer, RecordingDelivery};
use credflow_engine::{
    ActionId, ActionRequest, ActionResponse, FlowService, FormValidationResponse, HaltResponse,
    Services, StepView,
};
use credflow_replication::EwmaCompletionStatistics;
use credflow_types::{
    AuthContext, ErrorCode, FlowConfig, FlowError, FlowKind, FlowStep, FormData, FormField,
    NewUserProfile, PasswordData, ProfileId, SessionId, StepOrTerminal, SubjectState,
    TerminalStep, TokenChannel, UserIdentity,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    service: FlowService,
    directory: Arc<MemoryDirectory>,
    delivery: Arc<RecordingDelivery>,
    auth: AuthContext,
}

impl Harness {
    fn new(profiles: &[(&str, NewUserProfile)]) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let delivery = Arc::new(RecordingDelivery::new());
        let services = Services::new(
            directory.clone(),
            directory.clone(),
            directory.clone(),
            delivery.clone(),
            Arc::new(MemoryTokenIssuer::new()),
            Arc::new(EwmaCompletionStatistics::new(0.1)),
        );

        let mut config = FlowConfig::default();
        config.new_user.enabled = true;
        for (id, profile) in profiles {
            config
                .new_user
                .profiles
                .insert(ProfileId::new(*id), profile.clone());
        }

        Self {
            service: FlowService::new(config, services).unwrap(),
            directory,
            delivery,
            auth: AuthContext::anonymous(),
        }
    }

    fn standard() -> Self {
        Self::new(&[("default", verified_profile())])
    }

    fn begin(&self) -> SessionId {
        self.service
            .begin(FlowKind::NewUser, SubjectState::registration())
            .unwrap()
            .id
    }

    async fn act(&self, id: SessionId, request: ActionRequest) -> ActionResponse {
        self.act_at(id, request, Utc::now()).await
    }

    async fn act_at(
        &self,
        id: SessionId,
        request: ActionRequest,
        now: DateTime<Utc>,
    ) -> ActionResponse {
        let session = self.service.session(id).unwrap();
        let request = request.bound_to(&session);
        self.service
            .handle_action(id, &self.auth, &request, now)
            .await
            .unwrap()
    }

    async fn submit(&self, id: SessionId, form: FormData) -> StepView {
        let request = ActionRequest::post(ActionId::ProcessForm).with_form(form);
        expect_step(self.act(id, request).await)
    }

    async fn enter_code(&self, id: SessionId, code: &str) -> StepView {
        let request = ActionRequest::post(ActionId::EnterCode).with_param("code", code);
        expect_step(self.act(id, request).await)
    }

    fn token(&self, channel: TokenChannel) -> String {
        self.delivery
            .last_token(channel)
            .unwrap()
            .as_str()
            .to_string()
    }
}

fn verified_profile() -> NewUserProfile {
    NewUserProfile {
        form: vec![
            FormField::required("cn"),
            FormField::required("mail"),
            FormField::required("mobile"),
        ],
        email_verification: true,
        sms_verification: true,
        agreement_text: Some("Terms of use".into()),
        minimum_wait_ms: 5_000,
        ..Default::default()
    }
}

/// Registration that creates the account as soon as the form passes.
fn direct_profile(delete_on_fail: bool) -> NewUserProfile {
    NewUserProfile {
        form: vec![FormField::required("cn"), FormField::required("mail")],
        delete_on_fail,
        ..Default::default()
    }
}

fn registration(name: &str) -> FormData {
    FormData::new()
        .with_field("cn", name)
        .with_field("mail", format!("{}@example.com", name))
        .with_field("mobile", "+15550100")
        .with_passwords(PasswordData::new("s3cret!"), PasswordData::new("s3cret!"))
}

fn expect_step(response: ActionResponse) -> StepView {
    match response {
        ActionResponse::Step(view) => view,
        other => panic!("expected a step, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registration_runs_to_completion() {
    let h = Harness::standard();
    let id = h.begin();

    let view = h.service.next_step(id, Utc::now()).await.unwrap();
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Form));

    let mismatched = registration("ann")
        .with_passwords(PasswordData::new("s3cret!"), PasswordData::new("S3CRET!"));
    let view = h.submit(id, mismatched).await;
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Form));
    assert_eq!(view.error.map(|e| e.code), Some(ErrorCode::PasswordMismatch));

    let view = h.submit(id, registration("ann")).await;
    assert_eq!(
        view.step,
        StepOrTerminal::Step(FlowStep::TokenEntry(TokenChannel::Email))
    );
    assert!(view.token_destination.is_some());
    let sent = h.delivery.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, "ann@example.com");

    let view = h.enter_code(id, "NOT-A-CODE").await;
    assert_eq!(
        view.step,
        StepOrTerminal::Step(FlowStep::TokenEntry(TokenChannel::Email))
    );
    assert_eq!(view.error.map(|e| e.code), Some(ErrorCode::TokenIncorrect));

    let view = h.enter_code(id, &h.token(TokenChannel::Email)).await;
    assert_eq!(
        view.step,
        StepOrTerminal::Step(FlowStep::TokenEntry(TokenChannel::Sms))
    );
    assert_eq!(h.delivery.sent()[1].destination, "+15550100");

    let view = h.enter_code(id, &h.token(TokenChannel::Sms)).await;
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Agreement));
    assert!(h.directory.entry(&UserIdentity::new("ann")).is_none());

    let view = expect_step(h.act(id, ActionRequest::post(ActionId::Agree)).await);
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Wait));
    assert!(h.directory.entry(&UserIdentity::new("ann")).is_some());
    assert_eq!(h.directory.write_count(), 1);

    let progress = h.service.poll_progress(id, Utc::now()).await.unwrap();
    assert!(!progress.complete);

    let later = Utc::now() + Duration::seconds(6);
    let progress = h.service.poll_progress(id, later).await.unwrap();
    assert!(progress.complete);

    let response = h
        .act_at(id, ActionRequest::get(ActionId::Complete), later)
        .await;
    assert_eq!(response, ActionResponse::Halt(HaltResponse::Completed));
    assert_eq!(h.service.active_sessions(), 0);
}

#[tokio::test]
async fn email_link_opened_on_another_device() {
    let h = Harness::standard();
    let original = h.begin();
    h.service.next_step(original, Utc::now()).await.unwrap();
    h.submit(original, registration("bob")).await;
    let code = h.token(TokenChannel::Email);

    let fresh = h.begin();
    let view = h.enter_code(fresh, &code).await;
    assert!(view.error.is_none());
    assert_eq!(
        view.step,
        StepOrTerminal::Step(FlowStep::TokenEntry(TokenChannel::Sms))
    );
    let restored = h.service.session(fresh).unwrap();
    assert_eq!(restored.form.as_ref().unwrap().field("cn"), Some("bob"));
    assert_eq!(restored.profile_id(), Some(&ProfileId::new("default")));

    // The code was consumed by the other device.
    let view = h.enter_code(original, &code).await;
    assert_eq!(view.error.map(|e| e.code), Some(ErrorCode::TokenIncorrect));
}

#[tokio::test]
async fn sms_code_from_another_session_is_rejected() {
    let h = Harness::standard();
    let first = h.begin();
    let second = h.begin();
    for (id, name) in [(first, "cy"), (second, "dee")] {
        h.service.next_step(id, Utc::now()).await.unwrap();
        h.submit(id, registration(name)).await;
        h.enter_code(id, &h.token(TokenChannel::Email)).await;
    }

    // The most recent SMS code belongs to the second session.
    let foreign = h.token(TokenChannel::Sms);
    let view = h.enter_code(first, &foreign).await;
    assert_eq!(
        view.step,
        StepOrTerminal::Step(FlowStep::TokenEntry(TokenChannel::Sms))
    );
    assert_eq!(
        view.error.map(|e| e.code),
        Some(ErrorCode::TokenMismatchedSession)
    );
}

#[tokio::test]
async fn profile_choice_is_offered_and_sticks() {
    let staff = NewUserProfile {
        form: vec![FormField::required("cn")],
        ..Default::default()
    };
    let h = Harness::new(&[("guest", NewUserProfile::default()), ("staff", staff)]);
    let id = h.begin();

    let view = h.service.next_step(id, Utc::now()).await.unwrap();
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::ProfileChoice));

    let unknown = ActionRequest::post(ActionId::ProfileChoice).with_param("profile", "admin");
    let view = expect_step(h.act(id, unknown).await);
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::ProfileChoice));

    let choice = ActionRequest::post(ActionId::ProfileChoice).with_param("profile", "staff");
    let view = expect_step(h.act(id, choice).await);
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Form));
    let session = h.service.session(id).unwrap();
    assert_eq!(session.profile_id(), Some(&ProfileId::new("staff")));
}

#[tokio::test]
async fn validate_reports_without_storing() {
    let h = Harness::standard();
    let id = h.begin();
    h.service.next_step(id, Utc::now()).await.unwrap();

    let incomplete = FormData::new().with_field("cn", "eve");
    let request = ActionRequest::post(ActionId::Validate).with_form(incomplete);
    match h.act(id, request).await {
        ActionResponse::Halt(HaltResponse::FormValidation(FormValidationResponse {
            passed,
            message,
        })) => {
            assert!(!passed);
            assert!(message.is_some());
        }
        other => panic!("expected form validation, got {:?}", other),
    }
    assert!(h.service.session(id).unwrap().form.is_none());
}

#[tokio::test]
async fn disabled_or_unknown_registration_is_refused() {
    let h = Harness::standard();
    let err = h
        .service
        .begin_with_profile(ProfileId::new("missing"))
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::Authorization(ref e) if e.code == ErrorCode::ServiceNotAvailable
    ));

    let directory = Arc::new(MemoryDirectory::new());
    let services = Services::new(
        directory.clone(),
        directory.clone(),
        directory,
        Arc::new(RecordingDelivery::new()),
        Arc::new(MemoryTokenIssuer::new()),
        Arc::new(EwmaCompletionStatistics::new(0.1)),
    );
    let disabled = FlowService::new(FlowConfig::default(), services).unwrap();
    let err = disabled
        .begin(FlowKind::NewUser, SubjectState::registration())
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::Authorization(ref e) if e.code == ErrorCode::ServiceNotAvailable
    ));
}

#[tokio::test]
async fn url_profile_is_preselected() {
    let h = Harness::new(&[("guest", NewUserProfile::default()), ("staff", verified_profile())]);
    let session = h.service.begin_with_profile(ProfileId::new("staff")).unwrap();
    assert!(session.url_specified_profile);

    let view = h.service.next_step(session.id, Utc::now()).await.unwrap();
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Form));
}

#[tokio::test]
async fn url_profile_survives_reset_and_cannot_be_switched() {
    let h = Harness::new(&[("guest", NewUserProfile::default()), ("staff", verified_profile())]);
    let id = h.service.begin_with_profile(ProfileId::new("staff")).unwrap().id;
    h.service.next_step(id, Utc::now()).await.unwrap();

    let session = h.service.session(id).unwrap();
    let choice = ActionRequest::post(ActionId::ProfileChoice)
        .with_param("profile", "guest")
        .bound_to(&session);
    let err = h
        .service
        .handle_action(id, &h.auth, &choice, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::Validation(ref e) if e.code == ErrorCode::IncorrectRequestSequence
    ));

    let response = h.act(id, ActionRequest::post(ActionId::Reset)).await;
    assert_eq!(response, ActionResponse::Halt(HaltResponse::SessionReset));

    let view = h.service.next_step(id, Utc::now()).await.unwrap();
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Form));
    let session = h.service.session(id).unwrap();
    assert_eq!(session.profile_id(), Some(&ProfileId::new("staff")));
}

#[tokio::test]
async fn reset_starts_over() {
    let h = Harness::standard();
    let id = h.begin();
    h.service.next_step(id, Utc::now()).await.unwrap();
    h.submit(id, registration("fay")).await;

    let response = h.act(id, ActionRequest::post(ActionId::Reset)).await;
    assert_eq!(response, ActionResponse::Halt(HaltResponse::SessionReset));

    let view = h.service.next_step(id, Utc::now()).await.unwrap();
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Form));
    assert!(h.service.session(id).unwrap().form.is_none());
}

#[tokio::test]
async fn resent_code_replaces_the_previous_one() {
    let h = Harness::standard();
    let id = h.begin();
    h.service.next_step(id, Utc::now()).await.unwrap();
    h.submit(id, registration("cy")).await;
    let first = h.token(TokenChannel::Email);

    let err = h
        .service
        .resend_token(id, TokenChannel::Sms, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::Validation(ref e) if e.code == ErrorCode::IncorrectRequestSequence
    ));

    h.service
        .resend_token(id, TokenChannel::Email, Utc::now())
        .await
        .unwrap();
    assert_eq!(h.delivery.sent().len(), 2);
    let second = h.token(TokenChannel::Email);
    assert_ne!(first, second);

    let view = h.enter_code(id, &first).await;
    assert_eq!(view.error.map(|e| e.code), Some(ErrorCode::TokenIncorrect));

    let view = h.enter_code(id, &second).await;
    assert_eq!(
        view.step,
        StepOrTerminal::Step(FlowStep::TokenEntry(TokenChannel::Sms))
    );
}

#[tokio::test]
async fn failed_creation_is_cleaned_up_and_not_retried() {
    let h = Harness::new(&[("default", direct_profile(true))]);
    h.directory.set_fail_after_create(true);
    let id = h.begin();
    h.service.next_step(id, Utc::now()).await.unwrap();

    let view = h.submit(id, registration("gus")).await;
    assert_eq!(view.step, StepOrTerminal::Terminal(TerminalStep::Failed));
    assert_eq!(view.error.map(|e| e.code), Some(ErrorCode::WriteFailed));
    // One create, one delete.
    assert_eq!(h.directory.write_attempts(), 2);
    assert!(h.directory.entry(&UserIdentity::new("gus")).is_none());

    for _ in 0..3 {
        let view = h.service.next_step(id, Utc::now()).await.unwrap();
        assert_eq!(view.step, StepOrTerminal::Terminal(TerminalStep::Failed));
        assert!(view.error.is_none());
    }
    assert_eq!(h.directory.write_attempts(), 2);
    assert!(h.service.poll_progress(id, Utc::now()).await.is_err());

    let response = h.act(id, ActionRequest::post(ActionId::Reset)).await;
    assert_eq!(response, ActionResponse::Halt(HaltResponse::SessionReset));
    let view = h.service.next_step(id, Utc::now()).await.unwrap();
    assert_eq!(view.step, StepOrTerminal::Step(FlowStep::Form));
}

#[tokio::test]
async fn failed_creation_keeps_entry_without_cleanup() {
    let h = Harness::new(&[("default", direct_profile(false))]);
    h.directory.set_fail_after_create(true);
    let id = h.begin();
    h.service.next_step(id, Utc::now()).await.unwrap();

    let view = h.submit(id, registration("hal")).await;
    assert_eq!(view.step, StepOrTerminal::Terminal(TerminalStep::Failed));
    assert_eq!(h.directory.write_attempts(), 1);
    assert!(h.directory.entry(&UserIdentity::new("hal")).is_some());
}
