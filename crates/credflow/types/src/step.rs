//! Step identifiers returned by the resolver.
//!
//! Steps are opaque to the engine; a presentation layer maps each one to a
//! page or response.

use crate::token::TokenChannel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which guided flow a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    ChangePassword,
    NewUser,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::ChangePassword => write!(f, "change_password"),
            FlowKind::NewUser => write!(f, "new_user"),
        }
    }
}

/// A step that still needs user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "step", content = "channel")]
pub enum FlowStep {
    ProfileChoice,
    Warn,
    Agreement,
    CurrentPassword,
    Form,
    TokenEntry(TokenChannel),
    Wait,
}

impl fmt::Display for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStep::ProfileChoice => write!(f, "profile_choice"),
            FlowStep::Warn => write!(f, "warn"),
            FlowStep::Agreement => write!(f, "agreement"),
            FlowStep::CurrentPassword => write!(f, "current_password"),
            FlowStep::Form => write!(f, "form"),
            FlowStep::TokenEntry(channel) => write!(f, "token_entry:{}", channel),
            FlowStep::Wait => write!(f, "wait"),
        }
    }
}

/// End states of the guided part of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStep {
    /// Every gate is satisfied; the underlying action may be finalized.
    Ready,
    /// The write has propagated (or the wait ceiling passed) and awaits
    /// the client's acknowledgment.
    Completed,
    /// The final write failed. Only a reset starts over.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOrTerminal {
    Step(FlowStep),
    Terminal(TerminalStep),
}

impl StepOrTerminal {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepOrTerminal::Terminal(_))
    }

    pub fn step(&self) -> Option<FlowStep> {
        match self {
            StepOrTerminal::Step(step) => Some(*step),
            StepOrTerminal::Terminal(_) => None,
        }
    }
}

impl fmt::Display for StepOrTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOrTerminal::Step(step) => step.fmt(f),
            StepOrTerminal::Terminal(TerminalStep::Ready) => write!(f, "ready"),
            StepOrTerminal::Terminal(TerminalStep::Completed) => write!(f, "completed"),
            StepOrTerminal::Terminal(TerminalStep::Failed) => write!(f, "failed"),
        }
    }
}
