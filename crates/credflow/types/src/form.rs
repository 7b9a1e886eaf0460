//! Submitted form values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A password value. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PasswordData(String);

impl PasswordData {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare two passwords, optionally ignoring case.
    pub fn matches(&self, other: &PasswordData, case_sensitive: bool) -> bool {
        if case_sensitive {
            self.0 == other.0
        } else {
            self.0.to_lowercase() == other.0.to_lowercase()
        }
    }
}

impl fmt::Debug for PasswordData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordData(***)")
    }
}

/// Field values plus the new password pair, as entered by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormData {
    pub fields: BTreeMap<String, String>,
    pub password: Option<PasswordData>,
    pub confirm_password: Option<PasswordData>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_passwords(mut self, password: PasswordData, confirm: PasswordData) -> Self {
        self.password = Some(password);
        self.confirm_password = Some(confirm);
        self
    }

    /// Value of a field, treating blank values as absent.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Whether two submissions describe the same registration.
    ///
    /// Used to bind verification tokens to the form they were issued for.
    pub fn is_consistent_with(&self, other: &FormData) -> bool {
        self.fields == other.fields
            && self.password == other.password
            && self.confirm_password == other.confirm_password
    }
}
