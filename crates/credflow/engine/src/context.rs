//! Context objects handed to action handlers.

use chrono::{DateTime, Utc};
use credflow_replication::{CeilingPolicy, ReplicaProber};
use credflow_types::{AuthContext, ErrorCode, FlowConfig, FlowError, FlowResult, UserIdentity};

use crate::collaborators::Services;
use crate::dispatcher::ActionRequest;

/// Everything that stays fixed for the lifetime of a flow service:
/// configuration, collaborators and the objects derived from them.
#[derive(Clone)]
pub struct FlowEnvironment {
    pub config: FlowConfig,
    pub services: Services,
    pub prober: ReplicaProber,
    pub ceiling_policy: CeilingPolicy,
}

impl FlowEnvironment {
    pub fn new(config: FlowConfig, services: Services) -> FlowResult<Self> {
        config.validate()?;
        let prober = ReplicaProber::from_settings(services.probe.clone(), &config.replication)
            .map_err(|e| FlowError::Config(e.to_string()))?;
        let ceiling_policy = CeilingPolicy::from_settings(&config.replication)
            .map_err(|e| FlowError::Config(e.to_string()))?;
        Ok(Self {
            config,
            services,
            prober,
            ceiling_policy,
        })
    }
}

/// One admitted request.
pub struct ActionContext<'a> {
    pub env: &'a FlowEnvironment,
    pub auth: &'a AuthContext,
    pub request: &'a ActionRequest,
    pub now: DateTime<Utc>,
}

impl<'a> ActionContext<'a> {
    pub fn config(&self) -> &'a FlowConfig {
        &self.env.config
    }

    /// Identity of the authenticated caller.
    pub fn identity(&self) -> FlowResult<&'a UserIdentity> {
        self.auth
            .identity
            .as_ref()
            .ok_or_else(|| FlowError::authorization(ErrorCode::Unauthorized))
    }

    pub fn param(&self, name: &str) -> Option<&'a str> {
        self.request.param(name)
    }
}
