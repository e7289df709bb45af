//! Agent adapters.
//!
//! Every agent goes through the same three steps inside its task container:
//!
//! 1. `prepare_agent_code`: install the agent from the workspace copy
//! 2. `prepare_resources`: write the problem statement and agent config
//! 3. `evaluate`: launch the agent against the checkout and read back usage
//!
//! The set of adapters is closed ([`AgentKind`]); descriptors pick one by
//! `kind` and [`AgentRegistry`] resolves names to adapters once per run.

pub mod command;
pub mod trae;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AgentDescriptor, HarnessConfig};
use crate::corpus::Instance;
use crate::error::DockerError;
use crate::execution::{shell, ContainerController, ContainerHandle, ExecOutcome};
use crate::utils::tail;
use crate::workspace::{Workspace, WorkspaceError};

use super::result::AgentRun;

pub use command::CommandAdapter;
pub use trae::TraeAdapter;

/// Workspace file holding the problem statement.
pub const PROBLEM_FILE: &str = "problem_statement.md";

/// Supported agent adapters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// trae-agent, installed from source with pip.
    #[default]
    Trae,
    /// Any agent driven by an install list and a launch template.
    Command,
}

impl AgentKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentKind::Trae => "trae",
            AgentKind::Command => "command",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trae" | "trae-agent" | "trae_agent" => Ok(AgentKind::Trae),
            "command" | "generic" => Ok(AgentKind::Command),
            other => Err(format!("Unknown agent kind: {}", other)),
        }
    }
}

/// Everything an adapter may touch for one task.
pub struct AgentContext<'a> {
    pub controller: &'a ContainerController,
    pub handle: &'a ContainerHandle,
    pub workspace: &'a Workspace,
    pub instance: &'a Instance,
    pub config: &'a HarnessConfig,
}

/// Error type for agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Install command `{command}` exited with {exit_code}: {stderr}")]
    Install {
        command: String,
        exit_code: i64,
        stderr: String,
    },

    #[error("Agent setup failed: {0}")]
    Setup(String),

    #[error("Agent step timed out after {0:?}")]
    Timeout(Duration),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),
}

/// Trait for agent adapters.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    /// Installs the agent inside the container.
    async fn prepare_agent_code(&self, ctx: &AgentContext<'_>) -> Result<(), AgentError>;

    /// Writes the task input and agent configuration into the workspace.
    async fn prepare_resources(&self, ctx: &AgentContext<'_>) -> Result<(), AgentError>;

    /// Runs the agent on the checkout. Agent failures are reported in the
    /// returned [`AgentRun`], not as errors.
    async fn evaluate(&self, ctx: &AgentContext<'_>) -> Result<AgentRun, AgentError>;
}

/// Creates the adapter for a descriptor.
pub fn create_adapter(descriptor: AgentDescriptor) -> Box<dyn AgentAdapter> {
    match descriptor.kind {
        AgentKind::Trae => Box::new(TraeAdapter::new(descriptor)),
        AgentKind::Command => Box::new(CommandAdapter::new(descriptor)),
    }
}

/// Adapters by agent name, built once at startup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
}

impl AgentRegistry {
    pub fn new(descriptors: &[AgentDescriptor]) -> Self {
        let adapters = descriptors
            .iter()
            .map(|d| (d.name.clone(), Arc::from(create_adapter(d.clone()))))
            .collect();
        Self { adapters }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Template variables shared by install and launch commands.
fn template_vars<'a>(
    config: &'a HarnessConfig,
    descriptor: &'a AgentDescriptor,
    agent_dir: &'a str,
    problem_file: &'a str,
) -> [(&'static str, &'a str); 6] {
    [
        ("agent_dir", agent_dir),
        ("repo_dir", config.repo_dir.as_str()),
        ("swap_dir", config.swap_dir.as_str()),
        ("model", descriptor.model.as_str()),
        ("provider", descriptor.provider.as_str()),
        ("problem_file", problem_file),
    ]
}

/// Runs the descriptor's install commands in order under the setup timeout.
pub(crate) async fn run_install_commands(
    ctx: &AgentContext<'_>,
    descriptor: &AgentDescriptor,
) -> Result<(), AgentError> {
    let agent_dir = ctx.workspace.agent_dir().unwrap_or_default();
    let problem_file = ctx.workspace.container_path(PROBLEM_FILE);
    let vars = template_vars(ctx.config, descriptor, &agent_dir, &problem_file);
    let timeout = ctx.config.setup_timeout();

    for template in &descriptor.install_commands {
        let command = shell::render(template, &vars);
        debug!(agent = %descriptor.name, command = %command, "Running install command");
        let output = match ctx
            .controller
            .exec_with_env(ctx.handle, &command, timeout, passthrough_env(descriptor))
            .await?
        {
            ExecOutcome::Completed(output) => output,
            ExecOutcome::TimedOut { .. } => return Err(AgentError::Timeout(timeout)),
        };
        if !output.success() {
            return Err(AgentError::Install {
                command,
                exit_code: output.exit_code,
                stderr: tail(output.stderr.trim(), 2000),
            });
        }
    }
    info!(
        instance_id = %ctx.instance.instance_id,
        agent = %descriptor.name,
        commands = descriptor.install_commands.len(),
        "Agent installed"
    );
    Ok(())
}

/// Writes the problem statement, the agent's only task input.
pub(crate) fn write_problem_statement(ctx: &AgentContext<'_>) -> Result<String, AgentError> {
    ctx.workspace
        .write_file(PROBLEM_FILE, ctx.instance.problem_statement.as_bytes())?;
    Ok(ctx.workspace.container_path(PROBLEM_FILE))
}

/// `KEY=VALUE` entries for the descriptor's pass-through variables.
///
/// Values go to the exec environment only and are never written to disk.
pub(crate) fn passthrough_env(descriptor: &AgentDescriptor) -> Vec<String> {
    descriptor
        .env_passthrough
        .iter()
        .filter_map(|key| match std::env::var(key) {
            Ok(value) => Some(format!("{key}={value}")),
            Err(_) => {
                debug!(agent = %descriptor.name, variable = %key, "Pass-through variable not set");
                None
            }
        })
        .collect()
}

/// Launches `command` under the agent timeout and packages the outcome.
pub(crate) async fn launch(
    ctx: &AgentContext<'_>,
    descriptor: &AgentDescriptor,
    command: &str,
) -> Result<AgentRun, AgentError> {
    info!(
        instance_id = %ctx.instance.instance_id,
        agent = %descriptor.name,
        model = %descriptor.model,
        "Launching agent"
    );
    let outcome = ctx
        .controller
        .exec_with_env(
            ctx.handle,
            command,
            ctx.config.agent_timeout(),
            passthrough_env(descriptor),
        )
        .await?;

    Ok(match outcome {
        ExecOutcome::Completed(output) => {
            if !output.success() {
                info!(
                    instance_id = %ctx.instance.instance_id,
                    agent = %descriptor.name,
                    exit_code = output.exit_code,
                    stderr = %tail(output.stderr.trim(), 500),
                    "Agent exited with failure"
                );
            }
            AgentRun {
                exit_code: Some(output.exit_code),
                timed_out: false,
                ..AgentRun::default()
            }
        }
        ExecOutcome::TimedOut { elapsed } => {
            info!(
                instance_id = %ctx.instance.instance_id,
                agent = %descriptor.name,
                elapsed_secs = elapsed.as_secs(),
                "Agent timed out"
            );
            AgentRun {
                exit_code: None,
                timed_out: true,
                ..AgentRun::default()
            }
        }
    })
}
