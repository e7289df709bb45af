//! Generic command-line agent adapter.
//!
//! Install commands and the launch template come from the descriptor.
//! Template placeholders are substituted shell-quoted. Agents that want
//! their usage counted write `usage.json` into the swap directory.

use async_trait::async_trait;
use tracing::warn;

use super::{
    launch, run_install_commands, template_vars, write_problem_statement, AgentAdapter,
    AgentContext, AgentError, PROBLEM_FILE,
};
use crate::config::{AgentDescriptor, HarnessConfig};
use crate::execution::shell;
use crate::runner::result::{AgentRun, TokenUsage};
use crate::workspace::Workspace;

/// Workspace file a command agent may write its token usage to.
pub const USAGE_FILE: &str = "usage.json";

/// Adapter for descriptor-driven agents.
pub struct CommandAdapter {
    descriptor: AgentDescriptor,
}

impl CommandAdapter {
    pub fn new(descriptor: AgentDescriptor) -> Self {
        Self { descriptor }
    }

    fn launch_command(
        &self,
        config: &HarnessConfig,
        workspace: &Workspace,
    ) -> Result<String, AgentError> {
        let template = self.descriptor.run_command.as_deref().ok_or_else(|| {
            AgentError::Setup(format!("agent '{}' has no run_command", self.descriptor.name))
        })?;
        let agent_dir = workspace.agent_dir().unwrap_or_default();
        let problem_file = workspace.container_path(PROBLEM_FILE);
        let vars = template_vars(config, &self.descriptor, &agent_dir, &problem_file);
        Ok(format!(
            "cd {} && {}",
            shell::quote(&config.repo_dir),
            shell::render(template, &vars)
        ))
    }

    fn read_usage(&self, workspace: &Workspace) -> TokenUsage {
        let raw = match workspace.read_file(USAGE_FILE) {
            Ok(Some(raw)) => raw,
            Ok(None) => return TokenUsage::default(),
            Err(e) => {
                warn!(agent = %self.descriptor.name, error = %e, "Failed to read usage report");
                return TokenUsage::default();
            }
        };
        serde_json::from_str(&raw)
            .map(|report| TokenUsage::from_usage_report(&report))
            .unwrap_or_else(|e| {
                warn!(agent = %self.descriptor.name, error = %e, "Unparsable usage report");
                TokenUsage::default()
            })
    }
}

#[async_trait]
impl AgentAdapter for CommandAdapter {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn prepare_agent_code(&self, ctx: &AgentContext<'_>) -> Result<(), AgentError> {
        run_install_commands(ctx, &self.descriptor).await
    }

    async fn prepare_resources(&self, ctx: &AgentContext<'_>) -> Result<(), AgentError> {
        write_problem_statement(ctx)?;
        Ok(())
    }

    async fn evaluate(&self, ctx: &AgentContext<'_>) -> Result<AgentRun, AgentError> {
        let command = self.launch_command(ctx.config, ctx.workspace)?;
        let mut run = launch(ctx, &self.descriptor, &command).await?;
        run.usage = self.read_usage(ctx.workspace);
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::Instance;
    use crate::runner::agents::AgentKind;
    use crate::workspace::WorkspaceManager;

    fn command_agent(run_command: Option<&str>) -> AgentDescriptor {
        AgentDescriptor {
            name: "scripted".to_string(),
            kind: AgentKind::Command,
            model: "gpt-test".to_string(),
            repo_url: None,
            source_dir: None,
            run_command: run_command.map(str::to_string),
            ..AgentDescriptor::trae_default()
        }
    }

    async fn workspace_for(
        root: &std::path::Path,
        agent: &AgentDescriptor,
    ) -> (HarnessConfig, Workspace) {
        let config = HarnessConfig {
            work_root: Some(root.to_path_buf()),
            ..HarnessConfig::default()
        };
        let manager = WorkspaceManager::new(&config).unwrap();
        let instance = Instance::new("owner__repo-7", "owner/repo", "abc123");
        let workspace = manager.create(&instance, agent).await.unwrap();
        (config, workspace)
    }

    #[tokio::test]
    async fn test_launch_command_renders_placeholders() {
        let root = tempfile::tempdir().unwrap();
        let agent = command_agent(Some("my-agent --task {problem_file} --model {model} --in {repo_dir}"));
        let (config, workspace) = workspace_for(root.path(), &agent).await;

        let command = CommandAdapter::new(agent)
            .launch_command(&config, &workspace)
            .unwrap();
        assert_eq!(
            command,
            "cd /workdir/repo && my-agent --task /workdir/swap/problem_statement.md \
             --model gpt-test --in /workdir/repo"
        );
    }

    #[tokio::test]
    async fn test_launch_command_quotes_values() {
        let root = tempfile::tempdir().unwrap();
        let mut agent = command_agent(Some("run --model {model}"));
        agent.model = "model with spaces".to_string();
        let (config, workspace) = workspace_for(root.path(), &agent).await;

        let command = CommandAdapter::new(agent)
            .launch_command(&config, &workspace)
            .unwrap();
        assert!(command.ends_with("run --model 'model with spaces'"));
    }

    #[tokio::test]
    async fn test_missing_run_command() {
        let root = tempfile::tempdir().unwrap();
        let agent = command_agent(None);
        let (config, workspace) = workspace_for(root.path(), &agent).await;

        let err = CommandAdapter::new(agent)
            .launch_command(&config, &workspace)
            .unwrap_err();
        assert!(matches!(err, AgentError::Setup(ref msg) if msg.contains("no run_command")));
    }

    #[tokio::test]
    async fn test_read_usage_reports() {
        let root = tempfile::tempdir().unwrap();
        let agent = command_agent(Some("run"));
        let (_, workspace) = workspace_for(root.path(), &agent).await;
        let adapter = CommandAdapter::new(agent);

        assert_eq!(adapter.read_usage(&workspace), TokenUsage::default());

        workspace
            .write_file(USAGE_FILE, br#"{"input_tokens": 1200, "output_tokens": 300}"#)
            .unwrap();
        assert_eq!(adapter.read_usage(&workspace), TokenUsage::new(1200, 300));

        workspace
            .write_file(USAGE_FILE, br#"{"total_tokens": 4200}"#)
            .unwrap();
        assert_eq!(adapter.read_usage(&workspace).total(), 4200);

        workspace.write_file(USAGE_FILE, b"{not json").unwrap();
        assert_eq!(adapter.read_usage(&workspace), TokenUsage::default());
    }
}
