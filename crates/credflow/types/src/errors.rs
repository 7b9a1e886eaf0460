//! Error taxonomy for credflow.
//!
//! Two kinds of failure reach the user: [`StepError`]s are recorded in the
//! session and shown once on the next rendered step, while
//! [`DispatchError`]s reject a request outright and leave the session as it
//! was. [`FlowError`] is the `Result` error type of every fallible operation.

use crate::ids::SessionId;
use crate::step::FlowKind;
use crate::HttpMethod;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Whether a step error is correctable by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input; the user stays on the current step and may retry.
    Validation,
    /// The action is not permitted; the flow halts.
    Authorization,
}

/// Machine-readable error codes surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingParameter,
    BadCurrentPassword,
    IncorrectResponse,
    PasswordMismatch,
    PasswordPolicy,
    PasswordTooSoon,
    TokenIncorrect,
    TokenMismatchedSession,
    TokenExpired,
    BadCaptcha,
    WriteFailed,
    IncorrectRequestSequence,
    PasswordRequired,
    Unauthorized,
    ServiceNotAvailable,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::MissingParameter => "missing parameter",
            ErrorCode::BadCurrentPassword => "current password is incorrect",
            ErrorCode::IncorrectResponse => "one or more values are incorrect",
            ErrorCode::PasswordMismatch => "passwords do not match",
            ErrorCode::PasswordPolicy => "password does not meet policy",
            ErrorCode::PasswordTooSoon => "password was changed too recently",
            ErrorCode::TokenIncorrect => "verification code is incorrect",
            ErrorCode::TokenMismatchedSession => "verification code does not match current session",
            ErrorCode::TokenExpired => "verification code has expired",
            ErrorCode::BadCaptcha => "captcha response is incorrect",
            ErrorCode::WriteFailed => "directory update failed",
            ErrorCode::IncorrectRequestSequence => "request received out of sequence",
            ErrorCode::PasswordRequired => "a password authentication is required",
            ErrorCode::Unauthorized => "not authorized",
            ErrorCode::ServiceNotAvailable => "service not available",
        };
        f.write_str(text)
    }
}

/// An error attached to a session and surfaced exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub detail: Option<String>,
}

impl StepError {
    pub fn validation(code: ErrorCode) -> Self {
        Self {
            class: ErrorClass::Validation,
            code,
            detail: None,
        }
    }

    pub fn authorization(code: ErrorCode) -> Self {
        Self {
            class: ErrorClass::Authorization,
            code,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.code, detail),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Rejection of an inbound action before any handler runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unrecognized action '{0}'")]
    UnknownAction(String),

    #[error("action '{action}' is not part of the {flow} flow")]
    ActionNotInFlow { action: String, flow: FlowKind },

    #[error("action '{action}' does not accept {method}")]
    MethodNotAllowed { action: String, method: HttpMethod },

    #[error("authentication state does not permit action '{action}'")]
    AuthenticationMismatch { action: String },

    #[error("request is not bound to this session")]
    BindingMismatch,

    #[error("stale request sequence: expected {expected}, got {received}")]
    StaleSequence { expected: u64, received: u64 },

    #[error("too many requests, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("validation error: {0}")]
    Validation(StepError),

    #[error("authorization error: {0}")]
    Authorization(StepError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

impl FlowError {
    pub fn validation(code: ErrorCode) -> Self {
        FlowError::Validation(StepError::validation(code))
    }

    pub fn authorization(code: ErrorCode) -> Self {
        FlowError::Authorization(StepError::authorization(code))
    }

    /// The step error to store in the session, if this error is one.
    pub fn as_step_error(&self) -> Option<&StepError> {
        match self {
            FlowError::Validation(e) | FlowError::Authorization(e) => Some(e),
            _ => None,
        }
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
