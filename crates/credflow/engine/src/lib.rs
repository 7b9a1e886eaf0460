//! # Credflow Engine
//!
//! Guided self-service identity flows: changing a password and registering
//! a new account.
//!
//! ## Key Components
//!
//! - [`StepResolver`]: decides which step a session shows next
//! - [`ActionDispatcher`]: admits inbound actions and runs their handlers
//!   against a draft of the session
//! - [`TokenVerificationTracker`]: issues and checks out-of-band codes
//! - [`FlowService`]: owns live sessions and ties the pieces together
//! - [`memory`]: in-memory collaborators for tests and local simulation
//!
//! Directory writes, challenge delivery, token storage and replica probing
//! are reached through the traits in [`collaborators`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use credflow_engine::memory::{MemoryDirectory, MemoryTokenIssuer, RecordingDelivery};
//! use credflow_engine::{FlowService, Services};
//! use credflow_replication::EwmaCompletionStatistics;
//! use credflow_types::{FlowConfig, FlowKind, SubjectState};
//!
//! # async fn example() -> credflow_types::FlowResult<()> {
//! let directory = Arc::new(MemoryDirectory::new().with_auto_propagate());
//! let services = Services::new(
//!     directory.clone(),
//!     directory.clone(),
//!     directory,
//!     Arc::new(RecordingDelivery::new()),
//!     Arc::new(MemoryTokenIssuer::new()),
//!     Arc::new(EwmaCompletionStatistics::new(0.2)),
//! );
//! let service = FlowService::new(FlowConfig::default(), services)?;
//! let session = service.begin(FlowKind::ChangePassword, SubjectState::default())?;
//! let view = service.next_step(session.id, Utc::now()).await?;
//! println!("next step: {}", view.step);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod actions;
pub mod collaborators;
pub mod context;
pub mod dispatcher;
pub mod memory;
pub mod orchestrator;
pub mod resolver;
pub mod session;
pub mod step_plan;
pub mod token_tracker;

pub use collaborators::{
    AttributeVerifier, CaptchaVerifier, ChallengeDelivery, CollaboratorError, CollaboratorResult,
    DirectoryWriter, PasswordPolicy, Services, TokenIssuer, TokenPayload, WritePayload,
};
pub use context::{ActionContext, FlowEnvironment};
pub use dispatcher::{
    ActionDefinition, ActionDispatcher, ActionHandler, ActionId, ActionRegistry, ActionRequest,
    AuthRequirement, FormValidationResponse, HaltResponse, Outcome, RedirectTarget,
    RequestBinding,
};
pub use orchestrator::{ActionResponse, FlowService, StepView};
pub use resolver::{Resolution, SessionPatch, StepResolver};
pub use session::{ActionWindow, SessionBinding, WorkflowSession};
pub use step_plan::{StepDefinition, StepPlan, StepRequirement};
pub use token_tracker::{TokenVerificationTracker, VerifyFailure, VerifyOutcome};

pub use credflow_replication::{CompletionStatistics, DirectoryProbe};
