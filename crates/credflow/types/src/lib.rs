//! Credflow domain types.
//!
//! Everything here is plain data: identifiers, the caller's authentication
//! context, the subject's password status, gate flags, token verification
//! progress, step identifiers, the error taxonomy and configuration.
//! Behaviour lives in `credflow-replication` and `credflow-engine`.

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod form;
pub mod gates;
pub mod ids;
pub mod step;
pub mod subject;
pub mod token;

pub use auth::{AuthContext, AuthenticationType, HttpMethod, Permission};
pub use config::{
    ChangePasswordSettings, DispatchSettings, FlowConfig, FormField, NewUserProfile,
    NewUserSettings, ReplicaEndpoint, ReplicationSettings, RequireCurrentPasswordMode,
    TokenSettings,
};
pub use errors::{DispatchError, ErrorClass, ErrorCode, FlowError, FlowResult, StepError};
pub use form::{FormData, PasswordData};
pub use gates::{CompletedGates, Gate};
pub use ids::{ProfileId, ReplicaId, SessionId, TokenKey, UserIdentity};
pub use step::{FlowKind, FlowStep, StepOrTerminal, TerminalStep};
pub use subject::{AuthSource, PasswordStatus, SubjectState};
pub use token::{IssuedToken, TokenChannel, TokenVerificationProgress};
