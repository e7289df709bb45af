//! trae-agent adapter.
//!
//! The agent source is installed with pip from the workspace copy. Its YAML
//! config names the provider and model; API keys stay in the exec
//! environment. Token usage is read from the trajectory file the agent
//! writes into the workspace.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    launch, run_install_commands, write_problem_statement, AgentAdapter, AgentContext, AgentError,
};
use crate::config::AgentDescriptor;
use crate::execution::shell;
use crate::runner::result::{AgentRun, TokenUsage};

/// Workspace file holding the generated trae config.
pub const CONFIG_FILE: &str = "trae_config.yaml";

/// Workspace file the agent writes its trajectory to.
pub const TRAJECTORY_FILE: &str = "trajectory.json";

const MODEL_KEY: &str = "trae_agent_model";
const DEFAULT_MAX_STEPS: u32 = 150;
const DEFAULT_TOOLS: [&str; 4] = [
    "bash",
    "str_replace_based_edit_tool",
    "sequentialthinking",
    "task_done",
];

#[derive(Debug, Serialize)]
struct TraeConfig {
    agents: BTreeMap<&'static str, TraeAgentSection>,
    model_providers: BTreeMap<String, ProviderSection>,
    models: BTreeMap<&'static str, ModelSection>,
}

#[derive(Debug, Serialize)]
struct TraeAgentSection {
    enable_lakeview: bool,
    model: &'static str,
    max_steps: u32,
    tools: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ProviderSection {
    provider: String,
}

#[derive(Debug, Serialize)]
struct ModelSection {
    model_provider: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    parallel_tool_calls: bool,
}

/// Adapter for trae-agent.
pub struct TraeAdapter {
    descriptor: AgentDescriptor,
}

impl TraeAdapter {
    pub fn new(descriptor: AgentDescriptor) -> Self {
        Self { descriptor }
    }

    fn render_config(&self) -> Result<String, AgentError> {
        let d = &self.descriptor;
        let config = TraeConfig {
            agents: BTreeMap::from([(
                "trae_agent",
                TraeAgentSection {
                    enable_lakeview: false,
                    model: MODEL_KEY,
                    max_steps: d.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
                    tools: DEFAULT_TOOLS.to_vec(),
                },
            )]),
            model_providers: BTreeMap::from([(
                d.provider.clone(),
                ProviderSection {
                    provider: d.provider.clone(),
                },
            )]),
            models: BTreeMap::from([(
                MODEL_KEY,
                ModelSection {
                    model_provider: d.provider.clone(),
                    model: d.model.clone(),
                    max_tokens: 4096,
                    temperature: 0.5,
                    parallel_tool_calls: false,
                },
            )]),
        };
        serde_yaml::to_string(&config).map_err(|e| AgentError::Serialize(e.to_string()))
    }

    fn launch_command(&self, ctx: &AgentContext<'_>) -> String {
        let ws = ctx.workspace;
        let d = &self.descriptor;
        format!(
            "cd {repo} && trae-cli run --file {problem} --working-dir {repo} --provider {provider} \
             --model {model} --config-file {config} --trajectory-file {trajectory}",
            repo = shell::quote(&ctx.config.repo_dir),
            problem = shell::quote(&ws.container_path(super::PROBLEM_FILE)),
            provider = shell::quote(&d.provider),
            model = shell::quote(&d.model),
            config = shell::quote(&ws.container_path(CONFIG_FILE)),
            trajectory = shell::quote(&ws.container_path(TRAJECTORY_FILE)),
        )
    }

    fn read_usage(&self, ctx: &AgentContext<'_>) -> TokenUsage {
        let raw = match ctx.workspace.read_file(TRAJECTORY_FILE) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(instance_id = %ctx.instance.instance_id, "No trajectory written");
                return TokenUsage::default();
            }
            Err(e) => {
                warn!(instance_id = %ctx.instance.instance_id, error = %e, "Failed to read trajectory");
                return TokenUsage::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(trajectory) => TokenUsage::from_trajectory(&trajectory),
            Err(e) => {
                warn!(instance_id = %ctx.instance.instance_id, error = %e, "Unparsable trajectory");
                TokenUsage::default()
            }
        }
    }
}

#[async_trait]
impl AgentAdapter for TraeAdapter {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn prepare_agent_code(&self, ctx: &AgentContext<'_>) -> Result<(), AgentError> {
        if ctx.workspace.agent_dir().is_none() {
            return Err(AgentError::Setup(format!(
                "agent '{}' has no source to install",
                self.descriptor.name
            )));
        }
        run_install_commands(ctx, &self.descriptor).await
    }

    async fn prepare_resources(&self, ctx: &AgentContext<'_>) -> Result<(), AgentError> {
        write_problem_statement(ctx)?;
        let config = self.render_config()?;
        ctx.workspace.write_file(CONFIG_FILE, config.as_bytes())?;
        Ok(())
    }

    async fn evaluate(&self, ctx: &AgentContext<'_>) -> Result<AgentRun, AgentError> {
        let command = self.launch_command(ctx);
        let mut run = launch(ctx, &self.descriptor, &command).await?;
        // The trajectory is flushed as the agent goes, so a timed-out run
        // still reports what it spent.
        run.usage = self.read_usage(ctx);
        Ok(run)
    }
}
