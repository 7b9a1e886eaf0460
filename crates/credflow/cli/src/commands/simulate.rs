//! `credflow simulate` - run a flow end to end against in-memory
//! collaborators, answering every step the way a user would.
//!
//! Time is simulated: each progress poll advances the clock by
//! `--poll-ms` instead of sleeping.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Subcommand;
use credflow_engine::memory::{
    DirectoryEntry, MemoryDirectory, MemoryTokenIssuer, RecordingDelivery,
};
use credflow_engine::{
    ActionId, ActionRequest, ActionResponse, FlowService, HaltResponse, Services, StepView,
};
use credflow_replication::EwmaCompletionStatistics;
use credflow_types::{
    AuthContext, FlowConfig, FlowKind, FlowStep, FormData, FormField, NewUserProfile,
    PasswordData, Permission, ProfileId, ReplicaEndpoint, SessionId, StepError, StepOrTerminal,
    SubjectState, TerminalStep, UserIdentity,
};
use serde::Serialize;
use tracing::debug;

use crate::error::{CliError, CliResult};
use crate::output::{emit, OutputFormat};

const CURRENT_PASSWORD: &str = "current-Secret1";
const NEW_PASSWORD: &str = "n3w-Secret!";
const MAX_ROUNDS: usize = 4096;

#[derive(Subcommand)]
pub enum SimulateCommands {
    /// Change a password and wait for the directory replicas to catch up
    ChangePassword {
        /// Directory identity of the simulated user
        #[arg(long, default_value = "uid=demo")]
        user: String,

        /// Replicas to simulate when the configuration lists none
        #[arg(long, default_value_t = 3)]
        replicas: usize,

        /// Simulated milliseconds between progress polls
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },

    /// Register a new account, answering every verification challenge
    NewUser {
        /// Profile to register with (otherwise chosen by the flow)
        #[arg(long)]
        profile: Option<String>,

        /// Simulated milliseconds between progress polls
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
}

pub async fn execute(
    command: SimulateCommands,
    config: FlowConfig,
    format: OutputFormat,
) -> CliResult<()> {
    match command {
        SimulateCommands::ChangePassword {
            user,
            replicas,
            poll_ms,
        } => change_password(config, UserIdentity::new(user), replicas, poll_ms, format).await,
        SimulateCommands::NewUser { profile, poll_ms } => {
            new_user(config, profile.map(ProfileId::new), poll_ms, format).await
        }
    }
}

/// One line of simulation output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
enum SimEvent<'a> {
    Step {
        step: StepOrTerminal,
        error: Option<&'a StepError>,
    },
    Action {
        action: &'a str,
    },
    Progress {
        elapsed_ms: i64,
        percent_complete: u8,
        complete: bool,
    },
    Finished {
        elapsed_ms: i64,
    },
}

impl SimEvent<'_> {
    fn text(&self) -> String {
        match self {
            SimEvent::Step { step, error: None } => format!("→ {}", step),
            SimEvent::Step {
                step,
                error: Some(e),
            } => format!("→ {} (error: {})", step, e),
            SimEvent::Action { action } => format!("  · {}", action),
            SimEvent::Progress {
                elapsed_ms,
                percent_complete,
                complete,
            } => format!(
                "  ⋯ {:>3}% after {}ms{}",
                percent_complete,
                elapsed_ms,
                if *complete { " (complete)" } else { "" }
            ),
            SimEvent::Finished { elapsed_ms } => format!("✓ Flow finished in {}ms", elapsed_ms),
        }
    }
}

/// What the simulated user does at a step.
enum Move {
    Send(ActionRequest),
    /// Wait for replication, polling progress.
    Wait,
}

/// Drives one session until it finishes.
struct Driver<'a> {
    service: &'a FlowService,
    auth: AuthContext,
    format: OutputFormat,
    poll: chrono::Duration,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
}

impl<'a> Driver<'a> {
    fn new(
        service: &'a FlowService,
        auth: AuthContext,
        poll_ms: u64,
        format: OutputFormat,
    ) -> Self {
        let now = Utc::now();
        Self {
            service,
            auth,
            format,
            poll: chrono::Duration::milliseconds(poll_ms.max(1) as i64),
            started: now,
            now,
        }
    }

    fn elapsed_ms(&self) -> i64 {
        (self.now - self.started).num_milliseconds()
    }

    fn emit(&self, event: SimEvent<'_>) -> CliResult<()> {
        emit(self.format, &event, || event.text())
    }

    async fn run(
        &mut self,
        id: SessionId,
        mut respond: impl FnMut(&StepView) -> CliResult<Move>,
    ) -> CliResult<()> {
        let mut view = self.service.next_step(id, self.now).await?;

        for _ in 0..MAX_ROUNDS {
            self.emit(SimEvent::Step {
                step: view.step,
                error: view.error.as_ref(),
            })?;
            if let Some(error) = &view.error {
                return Err(CliError::Simulation(format!("{} rejected: {}", view.step, error)));
            }

            let request = match respond(&view)? {
                Move::Send(request) => request,
                Move::Wait => {
                    self.now += self.poll;
                    let progress = self.service.poll_progress(id, self.now).await?;
                    self.emit(SimEvent::Progress {
                        elapsed_ms: self.elapsed_ms(),
                        percent_complete: progress.percent_complete,
                        complete: progress.complete,
                    })?;
                    if !progress.complete {
                        view = self.service.next_step(id, self.now).await?;
                        continue;
                    }
                    ActionRequest::get(ActionId::Complete)
                }
            };

            self.emit(SimEvent::Action {
                action: &request.action,
            })?;
            let request = request.with_binding(view.binding.clone());
            match self
                .service
                .handle_action(id, &self.auth, &request, self.now)
                .await?
            {
                ActionResponse::Step(next) => view = next,
                ActionResponse::Halt(HaltResponse::Completed) => {
                    return self.emit(SimEvent::Finished {
                        elapsed_ms: self.elapsed_ms(),
                    });
                }
                ActionResponse::Halt(other) => {
                    return Err(CliError::Simulation(format!("unexpected halt: {:?}", other)));
                }
            }
        }
        Err(CliError::Simulation(format!(
            "no completion after {} rounds",
            MAX_ROUNDS
        )))
    }
}

// ── Change password ─────────────────────────────────────────────

async fn change_password(
    mut config: FlowConfig,
    user: UserIdentity,
    replicas: usize,
    poll_ms: u64,
    format: OutputFormat,
) -> CliResult<()> {
    if config.replication.replicas.is_empty() {
        config.replication.replicas = (1..=replicas)
            .map(|i| ReplicaEndpoint::new(format!("r{}", i), format!("memory://r{}", i)))
            .collect();
    }
    let endpoints = config.replication.replicas.clone();

    let attributes: BTreeMap<String, String> = config
        .change_password
        .required_form
        .iter()
        .map(|f| (f.name.clone(), placeholder(&f.name)))
        .collect();
    let directory = Arc::new(MemoryDirectory::new().with_replicas(&endpoints));
    directory.add_entry(
        user.clone(),
        DirectoryEntry {
            password: Some(PasswordData::new(CURRENT_PASSWORD)),
            attributes: attributes.clone(),
        },
    );

    let services = in_memory_services(&config, directory.clone(), None);
    let service = FlowService::new(config, services)?;
    let session = service.begin(
        FlowKind::ChangePassword,
        SubjectState::default().with_current_password_known(true),
    )?;
    let auth = AuthContext::authenticated(user).with_permission(Permission::ChangePassword);

    let confirmation = attributes
        .iter()
        .fold(FormData::new(), |form, (name, value)| {
            form.with_field(name.as_str(), value.as_str())
        });
    let mut caught_up = 0;
    let mut driver = Driver::new(&service, auth, poll_ms, format);
    driver
        .run(session.id, |view| {
            Ok(match view.step {
                StepOrTerminal::Step(FlowStep::Warn) => Move::Send(
                    ActionRequest::post(ActionId::WarnResponse)
                        .with_param("warnResponse", "change"),
                ),
                StepOrTerminal::Step(FlowStep::Agreement) => {
                    Move::Send(ActionRequest::post(ActionId::Agree))
                }
                StepOrTerminal::Step(FlowStep::CurrentPassword | FlowStep::Form) => Move::Send(
                    ActionRequest::post(ActionId::Form)
                        .with_param("currentPassword", CURRENT_PASSWORD)
                        .with_form(confirmation.clone()),
                ),
                StepOrTerminal::Terminal(TerminalStep::Ready) => Move::Send(
                    ActionRequest::post(ActionId::Change).with_form(
                        FormData::new().with_passwords(
                            PasswordData::new(NEW_PASSWORD),
                            PasswordData::new(NEW_PASSWORD),
                        ),
                    ),
                ),
                StepOrTerminal::Step(FlowStep::Wait) => {
                    // One more replica catches up per poll.
                    if let Some(endpoint) = endpoints.get(caught_up) {
                        directory.propagate(&endpoint.id);
                        debug!(replica = %endpoint.id, "Replica caught up");
                        caught_up += 1;
                    }
                    Move::Wait
                }
                StepOrTerminal::Terminal(TerminalStep::Completed) => {
                    Move::Send(ActionRequest::get(ActionId::Complete))
                }
                other => {
                    return Err(CliError::Simulation(format!(
                        "{} is not part of a password change",
                        other
                    )))
                }
            })
        })
        .await
}

// ── New user ────────────────────────────────────────────────────

async fn new_user(
    mut config: FlowConfig,
    profile: Option<ProfileId>,
    poll_ms: u64,
    format: OutputFormat,
) -> CliResult<()> {
    if config.new_user.profiles.is_empty() {
        config
            .new_user
            .profiles
            .insert(ProfileId::new("default"), demo_profile());
    }
    config.new_user.enabled = true;
    let profiles = config.new_user.profiles.clone();

    let directory = Arc::new(MemoryDirectory::new());
    let delivery = Arc::new(RecordingDelivery::new());
    let services = in_memory_services(&config, directory, Some(delivery.clone()));
    let service = FlowService::new(config, services)?;
    let session = match profile {
        Some(profile) => service.begin_with_profile(profile)?,
        None => service.begin(FlowKind::NewUser, SubjectState::registration())?,
    };

    let mut driver = Driver::new(&service, AuthContext::anonymous(), poll_ms, format);
    driver
        .run(session.id, |view| {
            Ok(match view.step {
                StepOrTerminal::Step(FlowStep::ProfileChoice) => {
                    let first = profiles.keys().next().ok_or_else(|| {
                        CliError::Simulation("no profile to choose from".into())
                    })?;
                    Move::Send(
                        ActionRequest::post(ActionId::ProfileChoice)
                            .with_param("profile", first.as_str()),
                    )
                }
                StepOrTerminal::Step(FlowStep::Form) => {
                    let chosen = service
                        .session(view.session_id)?
                        .profile_id()
                        .and_then(|id| profiles.get(id))
                        .cloned()
                        .ok_or_else(|| CliError::Simulation("no profile selected".into()))?;
                    Move::Send(
                        ActionRequest::post(ActionId::ProcessForm)
                            .with_form(registration_form(&chosen)),
                    )
                }
                StepOrTerminal::Step(FlowStep::TokenEntry(channel)) => {
                    let code = delivery.last_token(channel).ok_or_else(|| {
                        CliError::Simulation(format!("no {} challenge was sent", channel))
                    })?;
                    Move::Send(
                        ActionRequest::post(ActionId::EnterCode).with_param("code", code.as_str()),
                    )
                }
                StepOrTerminal::Step(FlowStep::Agreement) => {
                    Move::Send(ActionRequest::post(ActionId::Agree))
                }
                StepOrTerminal::Step(FlowStep::Wait) => Move::Wait,
                StepOrTerminal::Terminal(TerminalStep::Completed) => {
                    Move::Send(ActionRequest::get(ActionId::Complete))
                }
                other => {
                    return Err(CliError::Simulation(format!(
                        "{} is not part of a registration",
                        other
                    )))
                }
            })
        })
        .await
}

// ── Internal helpers ────────────────────────────────────────────

fn in_memory_services(
    config: &FlowConfig,
    directory: Arc<MemoryDirectory>,
    delivery: Option<Arc<RecordingDelivery>>,
) -> Services {
    Services::new(
        directory.clone(),
        directory.clone(),
        directory,
        delivery.unwrap_or_default(),
        Arc::new(MemoryTokenIssuer::new()),
        Arc::new(EwmaCompletionStatistics::from_settings(&config.replication)),
    )
}

fn demo_profile() -> NewUserProfile {
    NewUserProfile {
        display_name: Some("Demo".into()),
        form: vec![FormField::required("cn"), FormField::required("mail")],
        email_verification: true,
        minimum_wait_ms: 2_000,
        ..Default::default()
    }
}

fn registration_form(profile: &NewUserProfile) -> FormData {
    let mut form = FormData::new()
        .with_field(profile.naming_field.as_str(), "demo")
        .with_field(profile.email_field.as_str(), "demo@example.com")
        .with_field(profile.phone_field.as_str(), "+15550100");
    for field in &profile.form {
        if form.field(&field.name).is_none() {
            form = form.with_field(field.name.as_str(), placeholder(&field.name));
        }
    }
    form.with_passwords(
        PasswordData::new(NEW_PASSWORD),
        PasswordData::new(NEW_PASSWORD),
    )
}

fn placeholder(field: &str) -> String {
    format!("demo-{}", field)
}
