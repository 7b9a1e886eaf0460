//! Flow service: owns the live sessions and drives them through the
//! resolver and the dispatcher.
//!
//! Sessions are kept in a concurrent map and updated clone-mutate-store.
//! A request works on its own copy and writes it back once finished, so
//! no map guard is ever held across an await point.

use chrono::{DateTime, Utc};
use credflow_replication::ProgressResponse;
use credflow_types::{
    AuthContext, ErrorCode, FlowConfig, FlowError, FlowKind, FlowResult, FlowStep, ProfileId,
    SessionId, StepError, StepOrTerminal, SubjectState, TerminalStep, TokenChannel,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::actions::new_user::{create_account, issue_token};
use crate::collaborators::Services;
use crate::context::FlowEnvironment;
use crate::dispatcher::{ActionDispatcher, ActionRequest, HaltResponse, Outcome, RequestBinding};
use crate::resolver::{Resolution, StepResolver};
use crate::session::WorkflowSession;

/// What a presentation layer needs to render the current step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub session_id: SessionId,
    pub step: StepOrTerminal,
    /// Error from the previous request, shown exactly once.
    pub error: Option<StepError>,
    /// Binding the next request must echo back.
    pub binding: RequestBinding,
    /// Masked address the current challenge went to.
    pub token_destination: Option<String>,
}

impl StepView {
    fn new(session: &WorkflowSession, resolution: Resolution) -> Self {
        let token_destination = match resolution.step {
            StepOrTerminal::Step(FlowStep::TokenEntry(_)) => {
                session.token_progress.destination_display.clone()
            }
            _ => None,
        };
        Self {
            session_id: session.id,
            step: resolution.step,
            error: resolution.surfaced_error,
            binding: RequestBinding::from(&session.binding),
            token_destination,
        }
    }
}

/// What caused a session to be advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// An admitted action was just committed.
    Action,
    /// A plain render request. Never writes to the directory.
    Read,
}

/// Result of one handled action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "body")]
pub enum ActionResponse {
    Step(StepView),
    Halt(HaltResponse),
}

pub struct FlowService {
    env: FlowEnvironment,
    dispatcher: ActionDispatcher,
    resolver: StepResolver,
    sessions: DashMap<SessionId, WorkflowSession>,
}

impl FlowService {
    pub fn new(config: FlowConfig, services: Services) -> FlowResult<Self> {
        Ok(Self::with_dispatcher(
            FlowEnvironment::new(config, services)?,
            ActionDispatcher::default(),
        ))
    }

    /// Use a custom action table.
    pub fn with_dispatcher(env: FlowEnvironment, dispatcher: ActionDispatcher) -> Self {
        Self {
            env,
            dispatcher,
            resolver: StepResolver::new(),
            sessions: DashMap::new(),
        }
    }

    pub fn environment(&self) -> &FlowEnvironment {
        &self.env
    }

    /// Open a session for `flow`.
    pub fn begin(&self, flow: FlowKind, subject: SubjectState) -> FlowResult<WorkflowSession> {
        if flow == FlowKind::NewUser && !self.env.config.new_user.enabled {
            return Err(FlowError::authorization(ErrorCode::ServiceNotAvailable));
        }
        let session = WorkflowSession::new(flow, subject);
        info!(session_id = %session.id, flow = %flow, "Session started");
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    /// Open a registration whose profile was named in the entry URL.
    pub fn begin_with_profile(&self, profile: ProfileId) -> FlowResult<WorkflowSession> {
        if self.env.config.new_user.profile(&profile).is_none() {
            return Err(FlowError::Authorization(
                StepError::authorization(ErrorCode::ServiceNotAvailable)
                    .with_detail(profile.as_str()),
            ));
        }
        let mut session = self.begin(FlowKind::NewUser, SubjectState::registration())?;
        session.select_profile(profile)?;
        session.url_specified_profile = true;
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> FlowResult<WorkflowSession> {
        self.load(id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Resolve and render the session's current step.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn next_step(&self, id: SessionId, now: DateTime<Utc>) -> FlowResult<StepView> {
        let mut session = self.load(id)?;
        let view = self.advance(&mut session, now, Trigger::Read).await;
        self.store(session);
        view
    }

    /// Dispatch one inbound action and render whatever follows it.
    #[instrument(skip(self, auth, request), fields(session_id = %id, action = %request.action))]
    pub async fn handle_action(
        &self,
        id: SessionId,
        auth: &AuthContext,
        request: &ActionRequest,
        now: DateTime<Utc>,
    ) -> FlowResult<ActionResponse> {
        let mut session = self.load(id)?;
        let outcome = self
            .dispatcher
            .dispatch(&self.env, auth, request, &mut session, now)
            .await;

        match outcome {
            Ok(Outcome::Continue) => {
                let view = self.advance(&mut session, now, Trigger::Action).await;
                self.store(session);
                Ok(ActionResponse::Step(view?))
            }
            Ok(Outcome::Halt(HaltResponse::Completed)) => {
                self.sessions.remove(&id);
                info!(session_id = %id, "Flow finished");
                Ok(ActionResponse::Halt(HaltResponse::Completed))
            }
            Ok(Outcome::Halt(halt)) => {
                self.store(session);
                Ok(ActionResponse::Halt(halt))
            }
            Err(e) => {
                // Precondition failures leave their error on the session.
                self.store(session);
                Err(e)
            }
        }
    }

    /// Tick the session's replication tracker without dispatching.
    pub async fn poll_progress(
        &self,
        id: SessionId,
        now: DateTime<Utc>,
    ) -> FlowResult<ProgressResponse> {
        let tracker = {
            let session = self.sessions.get(&id).ok_or(FlowError::SessionNotFound(id))?;
            session
                .replication
                .clone()
                .ok_or_else(|| FlowError::validation(ErrorCode::IncorrectRequestSequence))?
        };
        Ok(tracker.tick_at(&self.env.prober, now).await.response())
    }

    /// Send a fresh challenge for a channel that is still being verified.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn resend_token(
        &self,
        id: SessionId,
        channel: TokenChannel,
        now: DateTime<Utc>,
    ) -> FlowResult<()> {
        let mut session = self.load(id)?;
        if !session.token_progress.is_issued(channel) || session.token_progress.is_passed(channel)
        {
            return Err(FlowError::validation(ErrorCode::IncorrectRequestSequence));
        }
        let result = issue_token(&self.env, &mut session, channel, now, true).await;
        self.store(session);
        result
    }

    /// Drop a session entirely.
    pub fn reset(&self, id: SessionId) -> FlowResult<()> {
        self.sessions
            .remove(&id)
            .map(|_| debug!(session_id = %id, "Session discarded"))
            .ok_or(FlowError::SessionNotFound(id))
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn load(&self, id: SessionId) -> FlowResult<WorkflowSession> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(FlowError::SessionNotFound(id))
    }

    fn store(&self, session: WorkflowSession) {
        self.sessions.insert(session.id, session);
    }

    /// Resolve, apply the resulting patch, and carry out the side effects
    /// the resolved step calls for. Works on a draft: on `Err` the session
    /// is left as it was, pending error included.
    async fn advance(
        &self,
        session: &mut WorkflowSession,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> FlowResult<StepView> {
        let mut draft = session.clone();
        let mut resolution = self.resolve(&mut draft, now)?;

        match resolution.step {
            StepOrTerminal::Step(FlowStep::TokenEntry(channel))
                if !draft.token_progress.is_issued(channel) =>
            {
                issue_token(&self.env, &mut draft, channel, now, false).await?;
            }
            StepOrTerminal::Terminal(TerminalStep::Ready)
                if draft.flow == FlowKind::NewUser && trigger == Trigger::Action =>
            {
                create_account(&self.env, &mut draft, now).await?;
                let surfaced = resolution.surfaced_error.take();
                resolution = self.resolve(&mut draft, now)?;
                resolution.surfaced_error = resolution.surfaced_error.or(surfaced);
            }
            _ => {}
        }

        let view = StepView::new(&draft, resolution);
        *session = draft;
        Ok(view)
    }

    fn resolve(&self, session: &mut WorkflowSession, now: DateTime<Utc>) -> FlowResult<Resolution> {
        let resolution = self.resolver.resolve(session, &self.env.config, now)?;
        resolution.patch.apply(session);
        Ok(resolution)
    }
}
