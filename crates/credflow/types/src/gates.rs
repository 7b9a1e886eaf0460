//! Gate flags accumulated by a workflow session.
//!
//! Flags only ever move from `false` to `true`. The sole way back is
//! [`CompletedGates::reset`], used when the whole flow is restarted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A checkpoint a flow must pass before the underlying action is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Form,
    Agreement,
    CurrentPassword,
    AllChecks,
    Warn,
}

impl Gate {
    pub const ALL: [Gate; 5] = [
        Gate::Form,
        Gate::Agreement,
        Gate::CurrentPassword,
        Gate::AllChecks,
        Gate::Warn,
    ];
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::Form => write!(f, "form"),
            Gate::Agreement => write!(f, "agreement"),
            Gate::CurrentPassword => write!(f, "current_password"),
            Gate::AllChecks => write!(f, "all_checks"),
            Gate::Warn => write!(f, "warn"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedGates {
    form_passed: bool,
    agreement_passed: bool,
    current_password_passed: bool,
    all_checks_passed: bool,
    warn_passed: bool,
}

impl CompletedGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_passed(&self, gate: Gate) -> bool {
        match gate {
            Gate::Form => self.form_passed,
            Gate::Agreement => self.agreement_passed,
            Gate::CurrentPassword => self.current_password_passed,
            Gate::AllChecks => self.all_checks_passed,
            Gate::Warn => self.warn_passed,
        }
    }

    /// Mark a gate as passed. Returns `true` if it was not passed before.
    pub fn mark(&mut self, gate: Gate) -> bool {
        let flag = match gate {
            Gate::Form => &mut self.form_passed,
            Gate::Agreement => &mut self.agreement_passed,
            Gate::CurrentPassword => &mut self.current_password_passed,
            Gate::AllChecks => &mut self.all_checks_passed,
            Gate::Warn => &mut self.warn_passed,
        };
        let newly = !*flag;
        *flag = true;
        newly
    }

    pub fn passed(&self) -> impl Iterator<Item = Gate> + '_ {
        Gate::ALL.into_iter().filter(|g| self.is_passed(*g))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
