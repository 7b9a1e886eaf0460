//! Action dispatcher.
//!
//! Routes an inbound action to its handler through a static table built
//! at startup. Before a handler runs the request must pass, in order:
//!
//! 1. the action id is recognised
//! 2. the action is defined for the session's flow
//! 3. the verb is allowed
//! 4. the caller's authentication state matches the action
//! 5. the session binding matches (and, for state-changing actions, the
//!    sequence number is current)
//! 6. the rate limit window has room
//! 7. the flow's own preconditions hold
//! 8. the handler's parameter validation passes
//!
//! The handler then runs against a draft copy of the session. The draft
//! replaces the session only when the handler succeeds, so a failed
//! action never leaves partial state behind.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credflow_replication::ProgressResponse;
use credflow_types::{
    AuthContext, AuthenticationType, DispatchError, DispatchSettings, ErrorCode, FlowError,
    FlowKind, FlowResult, FormData, HttpMethod, Permission, StepError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::actions;
use crate::context::{ActionContext, FlowEnvironment};
use crate::session::{ActionWindow, SessionBinding, WorkflowSession};

/// Recognised action identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionId {
    CheckProgress,
    Complete,
    Change,
    Form,
    Agree,
    WarnResponse,
    Reset,
    ProfileChoice,
    ProcessForm,
    Validate,
    EnterCode,
}

impl ActionId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionId::CheckProgress => "checkProgress",
            ActionId::Complete => "complete",
            ActionId::Change => "change",
            ActionId::Form => "form",
            ActionId::Agree => "agree",
            ActionId::WarnResponse => "warnResponse",
            ActionId::Reset => "reset",
            ActionId::ProfileChoice => "profileChoice",
            ActionId::ProcessForm => "processForm",
            ActionId::Validate => "validate",
            ActionId::EnterCode => "enterCode",
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionId {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "checkProgress" => ActionId::CheckProgress,
            "complete" => ActionId::Complete,
            "change" => ActionId::Change,
            "form" => ActionId::Form,
            "agree" => ActionId::Agree,
            "warnResponse" => ActionId::WarnResponse,
            "reset" => ActionId::Reset,
            "profileChoice" => ActionId::ProfileChoice,
            "processForm" => ActionId::ProcessForm,
            "validate" => ActionId::Validate,
            "enterCode" => ActionId::EnterCode,
            other => return Err(DispatchError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }
}

/// Binding echoed back by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBinding {
    pub nonce: String,
    pub sequence: u64,
}

impl From<&SessionBinding> for RequestBinding {
    fn from(binding: &SessionBinding) -> Self {
        Self {
            nonce: binding.nonce.clone(),
            sequence: binding.sequence,
        }
    }
}

/// An inbound action as the transport layer decoded it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    pub method: HttpMethod,
    pub binding: Option<RequestBinding>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub form: Option<FormData>,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            action: action.into(),
            method,
            binding: None,
            params: BTreeMap::new(),
            form: None,
        }
    }

    pub fn post(action: ActionId) -> Self {
        Self::new(action.as_str(), HttpMethod::Post)
    }

    pub fn get(action: ActionId) -> Self {
        Self::new(action.as_str(), HttpMethod::Get)
    }

    /// Bind the request to the session's current binding.
    pub fn bound_to(mut self, session: &WorkflowSession) -> Self {
        self.binding = Some(RequestBinding::from(&session.binding));
        self
    }

    pub fn with_binding(mut self, binding: RequestBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_form(mut self, form: FormData) -> Self {
        self.form = Some(form);
        self
    }

    /// A request parameter, treating blank values as absent.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Authentication state an action demands of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    Authenticated,
    Unauthenticated,
    Any,
}

impl AuthRequirement {
    pub fn permits(&self, auth: &AuthContext) -> bool {
        match self {
            AuthRequirement::Authenticated => auth.is_authenticated(),
            AuthRequirement::Unauthenticated => !auth.is_authenticated(),
            AuthRequirement::Any => true,
        }
    }
}

/// Where a redirect sends the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectTarget {
    /// Leave the flow and resume wherever the user was headed.
    Continue,
    /// The application's entry page.
    Home,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormValidationResponse {
    pub passed: bool,
    pub message: Option<String>,
}

/// A response that ends request processing without rendering a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HaltResponse {
    Progress(ProgressResponse),
    FormValidation(FormValidationResponse),
    Redirect {
        target: RedirectTarget,
        /// The transport must drop the caller's authentication first.
        unauthenticate: bool,
    },
    Completed,
    SessionReset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Resolve and render the next step.
    Continue,
    Halt(HaltResponse),
}

/// Behaviour of one action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Reject malformed requests before any state is touched.
    fn validate(&self, _request: &ActionRequest) -> FlowResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ActionContext<'_>,
        session: &mut WorkflowSession,
    ) -> FlowResult<Outcome>;
}

#[derive(Clone)]
pub struct ActionDefinition {
    pub methods: &'static [HttpMethod],
    pub auth: AuthRequirement,
    /// State-changing actions must present the current sequence number
    /// and advance it when they commit.
    pub mutating: bool,
    pub handler: Arc<dyn ActionHandler>,
}

impl ActionDefinition {
    pub fn new(
        methods: &'static [HttpMethod],
        auth: AuthRequirement,
        mutating: bool,
        handler: impl ActionHandler + 'static,
    ) -> Self {
        Self {
            methods,
            auth,
            mutating,
            handler: Arc::new(handler),
        }
    }
}

const POST: &[HttpMethod] = &[HttpMethod::Post];
const GET: &[HttpMethod] = &[HttpMethod::Get];
const GET_OR_POST: &[HttpMethod] = &[HttpMethod::Post, HttpMethod::Get];

/// Table of `(flow, action) -> definition`.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<(FlowKind, ActionId), ActionDefinition>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, flow: FlowKind, action: ActionId, definition: ActionDefinition) {
        self.actions.insert((flow, action), definition);
    }

    pub fn get(&self, flow: FlowKind, action: ActionId) -> Option<&ActionDefinition> {
        self.actions.get(&(flow, action))
    }

    pub fn with(
        mut self,
        flow: FlowKind,
        action: ActionId,
        definition: ActionDefinition,
    ) -> Self {
        self.register(flow, action, definition);
        self
    }

    /// Actions of both built-in flows.
    pub fn standard() -> Self {
        use actions::change_password as cp;
        use actions::new_user as nu;
        use ActionId::{
            Agree, Change, CheckProgress, Complete, EnterCode, Form, ProcessForm, ProfileChoice,
            Reset, Validate, WarnResponse,
        };
        use AuthRequirement::{Any, Authenticated, Unauthenticated};
        use FlowKind::{ChangePassword, NewUser};

        Self::new()
            .with(
                ChangePassword,
                CheckProgress,
                read_only(POST, Authenticated, cp::CheckProgress),
            )
            .with(ChangePassword, Complete, mutating(GET, Authenticated, cp::Complete))
            .with(ChangePassword, Change, mutating(POST, Authenticated, cp::Change))
            .with(ChangePassword, Form, mutating(POST, Authenticated, cp::Form))
            .with(ChangePassword, Agree, mutating(POST, Authenticated, actions::Agree))
            .with(ChangePassword, WarnResponse, mutating(POST, Authenticated, cp::WarnResponse))
            .with(ChangePassword, Reset, mutating(POST, Authenticated, cp::Reset))
            .with(NewUser, ProfileChoice, mutating(POST, Unauthenticated, nu::ProfileChoice))
            .with(NewUser, CheckProgress, read_only(GET, Any, nu::CheckProgress))
            .with(NewUser, Complete, mutating(GET, Any, nu::Complete))
            .with(NewUser, ProcessForm, mutating(POST, Unauthenticated, nu::ProcessForm))
            .with(NewUser, Validate, read_only(POST, Unauthenticated, nu::Validate))
            .with(NewUser, EnterCode, mutating(GET_OR_POST, Unauthenticated, nu::EnterCode))
            .with(NewUser, Reset, mutating(POST, Unauthenticated, nu::Reset))
            .with(NewUser, Agree, mutating(POST, Unauthenticated, actions::Agree))
    }
}

fn mutating(
    methods: &'static [HttpMethod],
    auth: AuthRequirement,
    handler: impl ActionHandler + 'static,
) -> ActionDefinition {
    ActionDefinition::new(methods, auth, true, handler)
}

fn read_only(
    methods: &'static [HttpMethod],
    auth: AuthRequirement,
    handler: impl ActionHandler + 'static,
) -> ActionDefinition {
    ActionDefinition::new(methods, auth, false, handler)
}

pub struct ActionDispatcher {
    registry: ActionRegistry,
}

impl ActionDispatcher {
    pub fn new(registry: ActionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Admit, run and commit one action.
    ///
    /// On `Err` the session is left exactly as it was, except that a
    /// failed flow precondition is recorded as the session's last error.
    #[instrument(skip_all, fields(session_id = %session.id, action = %request.action))]
    pub async fn dispatch(
        &self,
        env: &FlowEnvironment,
        auth: &AuthContext,
        request: &ActionRequest,
        session: &mut WorkflowSession,
        now: DateTime<Utc>,
    ) -> FlowResult<Outcome> {
        let (action, definition, window) = match self.admit(env, auth, request, session, now) {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(
                    session_id = %session.id,
                    action = %request.action,
                    error = %e,
                    "Action rejected"
                );
                return Err(e);
            }
        };

        if let Err(e) = check_preconditions(env, auth, session, action, now) {
            if let Some(step_error) = e.as_step_error() {
                session.fail(step_error.clone());
            }
            warn!(
                session_id = %session.id,
                action = %request.action,
                error = %e,
                "Flow precondition failed"
            );
            return Err(e);
        }

        definition.handler.validate(request)?;

        let mut draft = session.clone();
        draft.action_window = window;
        let ctx = ActionContext {
            env,
            auth,
            request,
            now,
        };
        let outcome = definition.handler.execute(&ctx, &mut draft).await?;

        if definition.mutating {
            draft.binding.sequence += 1;
        }
        *session = draft;
        debug!(
            session_id = %session.id,
            action = %request.action,
            outcome = ?outcome,
            "Action committed"
        );
        Ok(outcome)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn admit(
        &self,
        env: &FlowEnvironment,
        auth: &AuthContext,
        request: &ActionRequest,
        session: &WorkflowSession,
        now: DateTime<Utc>,
    ) -> FlowResult<(ActionId, &ActionDefinition, ActionWindow)> {
        let action: ActionId = request.action.parse()?;
        let definition =
            self.registry
                .get(session.flow, action)
                .ok_or_else(|| DispatchError::ActionNotInFlow {
                    action: action.to_string(),
                    flow: session.flow,
                })?;
        if !definition.methods.contains(&request.method) {
            return Err(DispatchError::MethodNotAllowed {
                action: action.to_string(),
                method: request.method,
            }
            .into());
        }
        if !definition.auth.permits(auth) {
            return Err(DispatchError::AuthenticationMismatch {
                action: action.to_string(),
            }
            .into());
        }
        check_binding(session, request, definition.mutating)?;
        let window = next_window(&session.action_window, &env.config.dispatch, now)?;
        Ok((action, definition, window))
    }
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new(ActionRegistry::standard())
    }
}

fn check_binding(
    session: &WorkflowSession,
    request: &ActionRequest,
    mutating: bool,
) -> Result<(), DispatchError> {
    let binding = request
        .binding
        .as_ref()
        .ok_or(DispatchError::BindingMismatch)?;
    if binding.nonce != session.binding.nonce {
        return Err(DispatchError::BindingMismatch);
    }
    if mutating && binding.sequence != session.binding.sequence {
        return Err(DispatchError::StaleSequence {
            expected: session.binding.sequence,
            received: binding.sequence,
        });
    }
    Ok(())
}

/// Fixed-window counter. A limit of zero disables the check.
fn next_window(
    current: &ActionWindow,
    settings: &DispatchSettings,
    now: DateTime<Utc>,
) -> FlowResult<ActionWindow> {
    if settings.max_actions_per_window == 0 {
        return Ok(current.clone());
    }
    let open = match current.window_start {
        Some(start) => Some((start, settings.window_end(start)?)),
        None => None,
    };
    match open {
        Some((start, end)) if now < end => {
            if current.count >= settings.max_actions_per_window {
                let retry_after_ms = (end - now).num_milliseconds().max(0) as u64;
                return Err(DispatchError::RateLimited { retry_after_ms }.into());
            }
            Ok(ActionWindow {
                window_start: Some(start),
                count: current.count + 1,
            })
        }
        _ => Ok(ActionWindow {
            window_start: Some(now),
            count: 1,
        }),
    }
}

fn check_preconditions(
    env: &FlowEnvironment,
    auth: &AuthContext,
    session: &WorkflowSession,
    action: ActionId,
    now: DateTime<Utc>,
) -> FlowResult<()> {
    match session.flow {
        FlowKind::ChangePassword => {
            if auth.auth_type == AuthenticationType::AuthWithoutPassword {
                return Err(FlowError::authorization(ErrorCode::PasswordRequired));
            }
            if !auth.has_permission(Permission::ChangePassword) {
                return Err(FlowError::authorization(ErrorCode::Unauthorized));
            }
            if action == ActionId::Change {
                check_minimum_lifetime(env, session, now)?;
            }
        }
        FlowKind::NewUser => {
            if !env.config.new_user.enabled {
                return Err(FlowError::authorization(ErrorCode::ServiceNotAvailable));
            }
        }
    }
    Ok(())
}

/// A password inside its minimum lifetime may not be changed yet, unless
/// the directory demands a new one and enforcement is relaxed for that case.
fn check_minimum_lifetime(
    env: &FlowEnvironment,
    session: &WorkflowSession,
    now: DateTime<Utc>,
) -> FlowResult<()> {
    let subject = &session.subject;
    let Some(next) = subject.password_status.next_allowed_change else {
        return Ok(());
    };
    if now >= next {
        return Ok(());
    }
    let settings = &env.config.change_password;
    if subject.requires_new_password && !settings.enforce_minimum_lifetime_when_required {
        debug!(
            session_id = %session.id,
            next_allowed = %next,
            "Password too young, enforcement skipped for required change"
        );
        return Ok(());
    }
    Err(FlowError::Authorization(
        StepError::authorization(ErrorCode::PasswordTooSoon).with_detail(next.to_rfc3339()),
    ))
}
