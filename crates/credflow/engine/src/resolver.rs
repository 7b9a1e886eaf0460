//! Workflow step resolver.
//!
//! Computes the next step from a session and configuration. Resolution is
//! a pure function of its inputs: the same session, configuration and
//! clock reading always produce the same [`Resolution`]. The few state
//! changes that resolution implies (consuming a surfaced error, picking
//! the only available profile, marking all checks passed) are returned as
//! a [`SessionPatch`] for the caller to apply.
//!
//! Priority:
//! 1. A pending error is surfaced alongside whatever step follows.
//! 2. While a replication tracker exists the flow waits for it.
//! 3. The first configured step whose requirement is still pending.
//! 4. Otherwise the flow is ready.

use chrono::{DateTime, Utc};
use credflow_types::{
    FlowConfig, FlowError, FlowKind, FlowResult, FlowStep, Gate, ProfileId, StepError,
    StepOrTerminal, TerminalStep,
};
use tracing::debug;

use crate::session::WorkflowSession;
use crate::step_plan::StepPlan;

/// State changes implied by a resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub consume_error: bool,
    pub select_profile: Option<ProfileId>,
    pub mark_all_checks_passed: bool,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        !self.consume_error && self.select_profile.is_none() && !self.mark_all_checks_passed
    }

    pub fn apply(&self, session: &mut WorkflowSession) {
        if self.consume_error {
            session.last_error = None;
        }
        if let Some(profile) = &self.select_profile {
            if session.profile_id.is_none() {
                session.profile_id = Some(profile.clone());
            }
        }
        if self.mark_all_checks_passed {
            session.gates.mark(Gate::AllChecks);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub step: StepOrTerminal,
    pub surfaced_error: Option<StepError>,
    pub patch: SessionPatch,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StepResolver;

impl StepResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(
        &self,
        session: &WorkflowSession,
        config: &FlowConfig,
        now: DateTime<Utc>,
    ) -> FlowResult<Resolution> {
        let surfaced_error = session.last_error.clone();
        let mut patch = SessionPatch {
            consume_error: surfaced_error.is_some(),
            ..Default::default()
        };

        let step = self.next_step(session, config, now, &mut patch)?;
        debug!(session_id = %session.id, flow = %session.flow, step = %step, "Resolved step");

        Ok(Resolution {
            step,
            surfaced_error,
            patch,
        })
    }

    fn next_step(
        &self,
        session: &WorkflowSession,
        config: &FlowConfig,
        now: DateTime<Utc>,
        patch: &mut SessionPatch,
    ) -> FlowResult<StepOrTerminal> {
        if session.write_failed {
            return Ok(StepOrTerminal::Terminal(TerminalStep::Failed));
        }
        if let Some(tracker) = &session.replication {
            return Ok(if tracker.is_terminal_at(now) {
                StepOrTerminal::Terminal(TerminalStep::Completed)
            } else {
                StepOrTerminal::Step(FlowStep::Wait)
            });
        }

        let plan = match session.flow {
            FlowKind::ChangePassword => StepPlan::change_password(&config.change_password),
            FlowKind::NewUser => {
                let profile_id = match session.profile_id() {
                    Some(id) => id.clone(),
                    None => match config.new_user.sole_profile() {
                        Some(id) => {
                            patch.select_profile = Some(id.clone());
                            id.clone()
                        }
                        None if config.new_user.profiles.is_empty() => {
                            return Err(FlowError::Config(
                                "no new-user profiles are configured".into(),
                            ));
                        }
                        None => return Ok(StepOrTerminal::Step(FlowStep::ProfileChoice)),
                    },
                };
                let profile = config.new_user.profile(&profile_id).ok_or_else(|| {
                    FlowError::Config(format!("session refers to unknown {}", profile_id))
                })?;
                StepPlan::new_user(profile)
            }
        };

        if let Some(definition) = plan.first_pending(session) {
            return Ok(StepOrTerminal::Step(definition.step));
        }

        if session.flow == FlowKind::ChangePassword && !session.gates.is_passed(Gate::AllChecks) {
            patch.mark_all_checks_passed = true;
        }
        Ok(StepOrTerminal::Terminal(TerminalStep::Ready))
    }
}
