//! Harness configuration.
//!
//! A single [`HarnessConfig`] value is built at startup (YAML file, then CLI
//! overrides) and passed by reference into every component. There is no
//! process-wide settings object.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::resources::ExecutionLimits;
use crate::runner::agents::AgentKind;

/// Default registry holding the prebuilt FeatBench images.
pub const DEFAULT_REGISTRY_PREFIX: &str = "ghcr.io/kndy666";

/// Default pytest invocation; test ids are appended shell-escaped.
pub const DEFAULT_TEST_COMMAND: &str = "python -m pytest -rA --tb=no -p no:cacheprovider";

/// Description of one agent under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent name; part of the result key and container name.
    pub name: String,
    /// Which adapter drives this agent.
    pub kind: AgentKind,
    /// Model identifier handed to the agent.
    pub model: String,
    /// Model provider handed to the agent.
    pub provider: String,
    /// Git URL of the agent source.
    #[serde(default)]
    pub repo_url: Option<String>,
    /// Branch of `repo_url` to check out.
    #[serde(default)]
    pub branch: Option<String>,
    /// Local agent source, used instead of `repo_url`.
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    /// Shell commands run inside the container to install the agent.
    ///
    /// Placeholders: `{agent_dir}`, `{repo_dir}`, `{swap_dir}`, `{model}`,
    /// `{provider}`.
    #[serde(default)]
    pub install_commands: Vec<String>,
    /// Launch command template (required for `command` agents).
    #[serde(default)]
    pub run_command: Option<String>,
    /// Host environment variables forwarded to the agent process only.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
    /// Step budget for agents that support one.
    #[serde(default)]
    pub max_steps: Option<u32>,
}

impl AgentDescriptor {
    /// The stock trae-agent descriptor.
    pub fn trae_default() -> Self {
        Self {
            name: "trae-agent".to_string(),
            kind: AgentKind::Trae,
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            repo_url: Some("https://github.com/bytedance/trae-agent.git".to_string()),
            branch: Some("main".to_string()),
            source_dir: None,
            install_commands: vec!["pip install -q -e {agent_dir}".to_string()],
            run_command: None,
            env_passthrough: vec!["OPENAI_API_KEY".to_string(), "OPENAI_BASE_URL".to_string()],
            max_steps: Some(150),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            field: format!("agents.{}", self.name),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("agent name is empty".to_string()));
        }
        if let Some(ch) = self
            .name
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        {
            return Err(invalid(format!("invalid character '{ch}' in agent name")));
        }
        if self.model.trim().is_empty() {
            return Err(invalid("model is empty".to_string()));
        }
        if self.repo_url.is_some() && self.source_dir.is_some() {
            return Err(invalid(
                "repo_url and source_dir are mutually exclusive".to_string(),
            ));
        }
        match self.kind {
            AgentKind::Trae if self.repo_url.is_none() && self.source_dir.is_none() => Err(
                invalid("trae agents need a repo_url or source_dir".to_string()),
            ),
            AgentKind::Command if self.run_command.is_none() => {
                Err(invalid("command agents need a run_command".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Configuration shared by every component of one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Number of evaluation tasks running at once.
    pub concurrency: usize,
    /// Wall-clock limit for one agent invocation.
    pub agent_timeout_secs: u64,
    /// Wall-clock limit for each test selection run.
    pub test_timeout_secs: u64,
    /// Wall-clock limit for setup commands (installs, git operations).
    pub setup_timeout_secs: u64,
    /// Wall-clock limit for a whole task, all phases included.
    pub task_timeout_secs: u64,
    /// Grace between SIGTERM and SIGKILL when a command times out.
    pub kill_grace_secs: u64,
    /// Attempts for transient provisioning failures.
    pub provision_retries: u32,
    /// Base delay between provisioning attempts; doubles each attempt.
    pub retry_backoff_secs: u64,
    /// Repository checkout inside the image.
    pub repo_dir: String,
    /// Mount point of the per-task workspace inside the container.
    pub swap_dir: String,
    /// Host directory for per-task workspaces and the agent source cache.
    pub work_root: Option<PathBuf>,
    /// Docker network mode for evaluation containers.
    pub network_mode: String,
    /// Request all NVIDIA GPUs for each container.
    pub gpu: bool,
    /// Run container processes as the host user owning the work root.
    pub run_as_host_user: bool,
    /// Registry the prebuilt images are pulled from.
    pub registry_prefix: String,
    /// Parallel pulls in build-only mode.
    pub pull_concurrency: usize,
    /// Leave containers behind for debugging.
    pub keep_containers: bool,
    /// Test runner command used when an instance has no override.
    pub test_command: String,
    /// Per-container resource limits.
    pub limits: ExecutionLimits,
    /// Agent descriptor table.
    pub agents: Vec<AgentDescriptor>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            agent_timeout_secs: 1800,
            test_timeout_secs: 600,
            setup_timeout_secs: 900,
            task_timeout_secs: 3600,
            kill_grace_secs: 10,
            provision_retries: 3,
            retry_backoff_secs: 2,
            repo_dir: "/workdir/repo".to_string(),
            swap_dir: "/workdir/swap".to_string(),
            work_root: None,
            network_mode: "host".to_string(),
            gpu: false,
            run_as_host_user: true,
            registry_prefix: DEFAULT_REGISTRY_PREFIX.to_string(),
            pull_concurrency: 2,
            keep_containers: false,
            test_command: DEFAULT_TEST_COMMAND.to_string(),
            limits: ExecutionLimits::default(),
            agents: vec![AgentDescriptor::trae_default()],
        }
    }
}

impl HarnessConfig {
    /// Loads a configuration from a YAML file. Missing fields keep defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Checks internal consistency. Called once before a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.pull_concurrency == 0 {
            return Err(invalid("pull_concurrency", "must be at least 1"));
        }
        for (field, value) in [
            ("agent_timeout_secs", self.agent_timeout_secs),
            ("test_timeout_secs", self.test_timeout_secs),
            ("setup_timeout_secs", self.setup_timeout_secs),
            ("task_timeout_secs", self.task_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.provision_retries == 0 {
            return Err(invalid("provision_retries", "must be at least 1"));
        }
        for (field, value) in [("repo_dir", &self.repo_dir), ("swap_dir", &self.swap_dir)] {
            if !value.starts_with('/') {
                return Err(invalid(field, "must be an absolute container path"));
            }
        }
        if self.test_command.trim().is_empty() {
            return Err(invalid("test_command", "must not be empty"));
        }
        if self.agents.is_empty() {
            return Err(invalid("agents", "at least one agent is required"));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            agent.validate()?;
            if !seen.insert(agent.name.as_str()) {
                return Err(invalid(
                    "agents",
                    &format!("duplicate agent name '{}'", agent.name),
                ));
            }
        }
        Ok(())
    }

    /// Looks up an agent descriptor by name.
    pub fn agent(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Resolves the agents selected for a run. An empty selection means all.
    pub fn select_agents(&self, names: &[String]) -> Result<Vec<AgentDescriptor>, ConfigError> {
        if names.is_empty() {
            return Ok(self.agents.clone());
        }
        names
            .iter()
            .map(|name| {
                self.agent(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownAgent(name.clone()))
            })
            .collect()
    }

    /// Host directory holding workspaces and the agent source cache.
    pub fn work_root(&self) -> PathBuf {
        self.work_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("featbench"))
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Delay before provisioning attempt `attempt` (1-based) is retried.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        Duration::from_secs(self.retry_backoff_secs.saturating_mul(factor))
    }
}
