//! Caller authentication context passed explicitly to the dispatcher.

use crate::ids::UserIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// How the caller's current session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationType {
    /// No authenticated user.
    Unauthenticated,
    /// Authenticated with a password the application knows.
    Authenticated,
    /// Authenticated by a mechanism that did not present a password
    /// (SSO assertion, client certificate).
    AuthWithoutPassword,
}

/// Permissions the caller's account holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ChangePassword,
}

/// Request verb, checked against an action's declared verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

/// Authentication state of the caller issuing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub identity: Option<UserIdentity>,
    pub auth_type: AuthenticationType,
    pub permissions: BTreeSet<Permission>,
}

impl AuthContext {
    /// Context for an anonymous caller.
    pub fn anonymous() -> Self {
        Self {
            identity: None,
            auth_type: AuthenticationType::Unauthenticated,
            permissions: BTreeSet::new(),
        }
    }

    /// Context for a password-authenticated caller.
    pub fn authenticated(identity: UserIdentity) -> Self {
        Self {
            identity: Some(identity),
            auth_type: AuthenticationType::Authenticated,
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_auth_type(mut self, auth_type: AuthenticationType) -> Self {
        self.auth_type = auth_type;
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some() && self.auth_type != AuthenticationType::Unauthenticated
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}
