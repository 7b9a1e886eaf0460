//! The per-user workflow session.
//!
//! A single owned value holding everything a flow has accumulated. It is
//! only changed through [`SessionPatch`](crate::SessionPatch) results of the
//! step resolver and through committed action handlers, and it serializes
//! so a transport layer can park it between requests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use credflow_replication::ReplicationProgressTracker;
use credflow_types::{
    CompletedGates, ErrorCode, FlowError, FlowKind, FlowResult, FormData, ProfileId, SessionId,
    StepError, SubjectState, TokenVerificationProgress,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Anti-replay binding every request must present.
///
/// `nonce` ties a request to this session; `sequence` advances with each
/// accepted state-changing action so a replayed request is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub nonce: String,
    pub sequence: u64,
}

impl SessionBinding {
    fn generate() -> Self {
        Self {
            nonce: Uuid::new_v4().simple().to_string(),
            sequence: 0,
        }
    }
}

/// Fixed-window action counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionWindow {
    pub window_start: Option<DateTime<Utc>>,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: SessionId,
    pub flow: FlowKind,
    pub(crate) profile_id: Option<ProfileId>,
    pub url_specified_profile: bool,
    pub gates: CompletedGates,
    pub last_error: Option<StepError>,
    pub token_progress: TokenVerificationProgress,
    pub replication: Option<Arc<ReplicationProgressTracker>>,
    /// Set once the final write failed; the flow cannot move on.
    #[serde(default)]
    pub write_failed: bool,
    pub subject: SubjectState,
    pub form: Option<FormData>,
    pub binding: SessionBinding,
    pub action_window: ActionWindow,
    pub created_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(flow: FlowKind, subject: SubjectState) -> Self {
        Self {
            id: SessionId::generate(),
            flow,
            profile_id: None,
            url_specified_profile: false,
            gates: CompletedGates::new(),
            last_error: None,
            token_progress: TokenVerificationProgress::new(),
            replication: None,
            write_failed: false,
            subject,
            form: None,
            binding: SessionBinding::generate(),
            action_window: ActionWindow::default(),
            created_at: Utc::now(),
        }
    }

    pub fn profile_id(&self) -> Option<&ProfileId> {
        self.profile_id.as_ref()
    }

    /// Select the new-user profile. Once chosen it cannot change until
    /// the session is reset; choosing the same profile again is a no-op.
    pub fn select_profile(&mut self, profile: ProfileId) -> FlowResult<()> {
        match &self.profile_id {
            Some(current) if *current == profile => Ok(()),
            Some(_) => Err(FlowError::validation(ErrorCode::IncorrectRequestSequence)),
            None => {
                self.profile_id = Some(profile);
                Ok(())
            }
        }
    }

    /// Record an error to show on the next rendered step.
    pub fn fail(&mut self, error: StepError) {
        self.last_error = Some(error);
    }

    /// Restart the flow. Identity, subject and binding nonce survive;
    /// everything accumulated is dropped. A profile named in the entry URL
    /// is kept, since the user never went through the profile choice.
    pub fn reset(&mut self) {
        if !self.url_specified_profile {
            self.profile_id = None;
        }
        self.gates.reset();
        self.last_error = None;
        self.token_progress = TokenVerificationProgress::new();
        self.replication = None;
        self.write_failed = false;
        self.form = None;
    }
}
