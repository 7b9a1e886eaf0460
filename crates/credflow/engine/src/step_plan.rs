//! Configured step order per flow.
//!
//! A plan is built from configuration alone. Steps whose configuration is
//! empty (blank agreement text, no required form fields, verification
//! turned off) are left out entirely rather than skipped at runtime.

use credflow_types::{
    AuthSource, ChangePasswordSettings, FlowStep, Gate, NewUserProfile,
    RequireCurrentPasswordMode, SubjectState, TokenChannel,
};

use crate::session::WorkflowSession;

/// Condition that must hold before the flow may advance past a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRequirement {
    Warn,
    Agreement,
    CurrentPassword(RequireCurrentPasswordMode),
    Form,
    Token(TokenChannel),
}

impl StepRequirement {
    /// Whether this requirement still blocks the flow.
    pub fn is_pending(&self, session: &WorkflowSession) -> bool {
        match self {
            StepRequirement::Warn => {
                warn_page_applies(&session.subject) && !session.gates.is_passed(Gate::Warn)
            }
            StepRequirement::Agreement => !session.gates.is_passed(Gate::Agreement),
            StepRequirement::CurrentPassword(mode) => {
                current_password_required(*mode, &session.subject)
                    && !session.gates.is_passed(Gate::CurrentPassword)
            }
            StepRequirement::Form => !session.gates.is_passed(Gate::Form),
            StepRequirement::Token(channel) => !session.token_progress.is_passed(*channel),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefinition {
    pub step: FlowStep,
    pub requirement: StepRequirement,
}

impl StepDefinition {
    fn new(step: FlowStep, requirement: StepRequirement) -> Self {
        Self { step, requirement }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPlan {
    steps: Vec<StepDefinition>,
}

impl StepPlan {
    /// Warn page, agreement, current password, confirmation form.
    pub fn change_password(settings: &ChangePasswordSettings) -> Self {
        let mut steps = vec![StepDefinition::new(FlowStep::Warn, StepRequirement::Warn)];
        if settings.agreement().is_some() {
            steps.push(StepDefinition::new(
                FlowStep::Agreement,
                StepRequirement::Agreement,
            ));
        }
        steps.push(StepDefinition::new(
            FlowStep::CurrentPassword,
            StepRequirement::CurrentPassword(settings.require_current_password),
        ));
        if !settings.required_form.is_empty() {
            steps.push(StepDefinition::new(FlowStep::Form, StepRequirement::Form));
        }
        Self { steps }
    }

    /// Registration form, email code, SMS code, agreement.
    pub fn new_user(profile: &NewUserProfile) -> Self {
        let mut steps = vec![StepDefinition::new(FlowStep::Form, StepRequirement::Form)];
        if profile.email_verification {
            steps.push(StepDefinition::new(
                FlowStep::TokenEntry(TokenChannel::Email),
                StepRequirement::Token(TokenChannel::Email),
            ));
        }
        if profile.sms_verification {
            steps.push(StepDefinition::new(
                FlowStep::TokenEntry(TokenChannel::Sms),
                StepRequirement::Token(TokenChannel::Sms),
            ));
        }
        if profile.agreement().is_some() {
            steps.push(StepDefinition::new(
                FlowStep::Agreement,
                StepRequirement::Agreement,
            ));
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn contains(&self, step: FlowStep) -> bool {
        self.steps.iter().any(|d| d.step == step)
    }

    /// First step whose requirement still blocks the flow.
    pub fn first_pending(&self, session: &WorkflowSession) -> Option<&StepDefinition> {
        self.steps.iter().find(|d| d.requirement.is_pending(session))
    }
}

/// The expiry warning is shown to users in their warn period who have not
/// opted to skip it, except when they arrived through a public module.
pub fn warn_page_applies(subject: &SubjectState) -> bool {
    subject.password_status.warn_period
        && !subject.skip_new_password
        && subject.auth_source != AuthSource::PublicModule
}

/// Whether the user must re-enter the current password.
///
/// Never asked of public-module sessions or when the application does not
/// hold the current password, since there would be nothing to compare with.
pub fn current_password_required(
    mode: RequireCurrentPasswordMode,
    subject: &SubjectState,
) -> bool {
    if subject.auth_source == AuthSource::PublicModule || !subject.current_password_known {
        return false;
    }
    match mode {
        RequireCurrentPasswordMode::False => false,
        RequireCurrentPasswordMode::True => true,
        RequireCurrentPasswordMode::NotExpired => {
            let status = subject.password_status;
            !status.expired
                && !status.pre_expired
                && !status.violates_policy
                && !subject.requires_new_password
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credflow_types::{FormField, PasswordStatus};

    fn known() -> SubjectState {
        SubjectState::default().with_current_password_known(true)
    }

    #[test]
    fn test_current_password_modes() {
        assert!(!current_password_required(RequireCurrentPasswordMode::False, &known()));
        assert!(current_password_required(RequireCurrentPasswordMode::True, &known()));
        assert!(current_password_required(RequireCurrentPasswordMode::NotExpired, &known()));

        let expired = known().with_password_status(PasswordStatus {
            expired: true,
            ..Default::default()
        });
        assert!(!current_password_required(RequireCurrentPasswordMode::NotExpired, &expired));
        assert!(current_password_required(RequireCurrentPasswordMode::True, &expired));
    }

    #[test]
    fn test_current_password_never_for_public_module_or_unknown() {
        let public = known().via_public_module();
        assert!(!current_password_required(RequireCurrentPasswordMode::True, &public));

        let unknown = SubjectState::default();
        assert!(!current_password_required(RequireCurrentPasswordMode::True, &unknown));
    }

    #[test]
    fn test_warn_page_conditions() {
        let warn = SubjectState::default().with_password_status(PasswordStatus {
            warn_period: true,
            ..Default::default()
        });
        assert!(warn_page_applies(&warn));

        let mut skipped = warn.clone();
        skipped.skip_new_password = true;
        assert!(!warn_page_applies(&skipped));

        assert!(!warn_page_applies(&warn.via_public_module()));
    }

    #[test]
    fn test_blank_agreement_omitted_from_plan() {
        let settings = ChangePasswordSettings {
            agreement_text: Some(String::new()),
            ..Default::default()
        };
        let plan = StepPlan::change_password(&settings);
        assert!(!plan.contains(FlowStep::Agreement));
        assert!(!plan.contains(FlowStep::Form));

        let settings = ChangePasswordSettings {
            agreement_text: Some("Terms".into()),
            required_form: vec![FormField::required("mail")],
            ..Default::default()
        };
        let plan = StepPlan::change_password(&settings);
        let order: Vec<_> = plan.steps().iter().map(|d| d.step).collect();
        assert_eq!(
            order,
            vec![
                FlowStep::Warn,
                FlowStep::Agreement,
                FlowStep::CurrentPassword,
                FlowStep::Form
            ]
        );
    }

    #[test]
    fn test_new_user_plan_order() {
        let profile = NewUserProfile {
            email_verification: true,
            sms_verification: true,
            agreement_text: Some("Rules".into()),
            ..Default::default()
        };
        let order: Vec<_> = StepPlan::new_user(&profile)
            .steps()
            .iter()
            .map(|d| d.step)
            .collect();
        assert_eq!(
            order,
            vec![
                FlowStep::Form,
                FlowStep::TokenEntry(TokenChannel::Email),
                FlowStep::TokenEntry(TokenChannel::Sms),
                FlowStep::Agreement,
            ]
        );
    }
}
