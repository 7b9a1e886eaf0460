//! `credflow check-config`

use std::collections::BTreeMap;

use credflow_engine::StepPlan;
use credflow_replication::CeilingPolicy;
use credflow_types::FlowConfig;
use serde::Serialize;

use crate::config::ConfigSource;
use crate::error::{CliError, CliResult};
use crate::output::{emit, OutputFormat};

#[derive(Debug, Serialize)]
struct ConfigSummary {
    source: String,
    change_password_steps: Vec<String>,
    new_user_enabled: bool,
    profiles: BTreeMap<String, Vec<String>>,
    replicas: Vec<String>,
    default_ceiling_ms: u64,
    wait_bounds_ms: (u64, u64),
    actions_per_window: Option<(u32, u64)>,
}

/// Validate the configuration and print what the flows will ask for.
pub fn execute(config: &FlowConfig, source: &ConfigSource, format: OutputFormat) -> CliResult<()> {
    CeilingPolicy::from_settings(&config.replication)
        .map_err(|e| CliError::Config(e.to_string()))?;

    let summary = summarize(config, source);
    emit(format, &summary, || render(&summary))
}

fn summarize(config: &FlowConfig, source: &ConfigSource) -> ConfigSummary {
    let step_names = |plan: StepPlan| {
        plan.steps()
            .iter()
            .map(|d| d.step.to_string())
            .collect::<Vec<_>>()
    };
    let source = match source {
        ConfigSource::File(path) => path.display().to_string(),
        ConfigSource::Defaults(path) => format!("defaults ({} not found)", path.display()),
    };
    let dispatch = &config.dispatch;
    let replication = &config.replication;

    ConfigSummary {
        source,
        change_password_steps: step_names(StepPlan::change_password(&config.change_password)),
        new_user_enabled: config.new_user.enabled,
        profiles: config
            .new_user
            .profiles
            .iter()
            .map(|(id, profile)| (id.as_str().to_string(), step_names(StepPlan::new_user(profile))))
            .collect(),
        replicas: replication
            .replicas
            .iter()
            .map(|r| format!("{} ({})", r.id, r.address))
            .collect(),
        default_ceiling_ms: replication.default_ceiling_ms,
        wait_bounds_ms: (replication.min_wait_ms, replication.max_wait_ms),
        actions_per_window: (dispatch.max_actions_per_window > 0)
            .then_some((dispatch.max_actions_per_window, dispatch.window_secs)),
    }
}

fn render(summary: &ConfigSummary) -> String {
    let mut lines = vec![
        format!("✓ Configuration is valid ({})", summary.source),
        format!(
            "  Change password: {}",
            summary.change_password_steps.join(" → ")
        ),
    ];
    if summary.new_user_enabled {
        for (id, steps) in &summary.profiles {
            lines.push(format!("  New user [{}]: {}", id, steps.join(" → ")));
        }
    } else {
        lines.push("  New user: disabled".into());
    }
    if summary.replicas.is_empty() {
        lines.push("  Replicas: none (time-based progress)".into());
    } else {
        lines.push(format!("  Replicas: {}", summary.replicas.join(", ")));
    }
    lines.push(format!(
        "  Wait ceiling: {}ms default, clamped to {}..{}ms",
        summary.default_ceiling_ms, summary.wait_bounds_ms.0, summary.wait_bounds_ms.1
    ));
    lines.push(match summary.actions_per_window {
        Some((count, secs)) => format!("  Rate limit: {} actions per {}s", count, secs),
        None => "  Rate limit: off".into(),
    });
    lines.join("\n")
}
