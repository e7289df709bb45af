//! The container runtime seam.
//!
//! Everything above this module talks to containers through
//! [`ContainerRuntime`]; the Docker implementation lives in
//! [`super::docker_client`]. Tests substitute an in-memory runtime.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::DockerError;
use crate::execution::resources::ExecutionLimits;

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    /// Image to start from.
    pub image: String,
    /// Command the container idles on.
    pub cmd: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Resource limits for the container.
    pub limits: ExecutionLimits,
    /// Bind mounts in `host:container:mode` format.
    pub binds: Vec<String>,
    /// User to run as (e.g., "1000:1000").
    pub user: Option<String>,
    /// Network mode (e.g., "none", "bridge", "host").
    pub network_mode: String,
    /// Request every NVIDIA GPU on the host.
    pub gpu: bool,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Creates a spec that keeps an interactive shell alive.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: vec!["/bin/bash".to_string()],
            working_dir: None,
            limits: ExecutionLimits::default(),
            binds: Vec::new(),
            user: None,
            network_mode: "host".to_string(),
            gpu: false,
            labels: HashMap::new(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_bind(mut self, host: &str, container: &str) -> Self {
        self.binds.push(format!("{host}:{container}:rw"));
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// Output of a command that ran to completion inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code of the command (-1 if the daemon did not report one).
    pub exit_code: i64,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Operations the harness needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks that the engine is reachable.
    async fn ping(&self) -> Result<(), DockerError>;

    /// Whether `image` is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, DockerError>;

    /// Pulls `image` from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), DockerError>;

    /// Adds the tag `target` to the local image `source`.
    async fn tag_image(&self, source: &str, target: &str) -> Result<(), DockerError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError>;

    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    /// Runs `cmd` in the container with extra `KEY=VALUE` environment entries.
    ///
    /// Does not enforce a timeout; callers wrap it.
    async fn exec(&self, id: &str, cmd: Vec<String>, env: Vec<String>)
        -> Result<ExecOutput, DockerError>;

    /// Writes `contents` to the absolute `path` inside the container.
    async fn upload_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), DockerError>;

    /// Force-removes the container and its anonymous volumes.
    ///
    /// Removing a container that no longer exists is not an error.
    async fn remove_container(&self, id: &str) -> Result<(), DockerError>;

    /// Whether a container with this id still exists.
    async fn container_exists(&self, id: &str) -> Result<bool, DockerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_builder() {
        let spec = ContainerSpec::new("featbench-x", "featbench_owner_repo:12")
            .with_working_dir("/workdir/repo")
            .with_bind("/tmp/ws", "/workdir/swap")
            .with_user(Some("1000:1000".to_string()))
            .with_network_mode("none")
            .with_gpu(true)
            .with_label("featbench.agent", "trae-agent");

        assert_eq!(spec.cmd, vec!["/bin/bash".to_string()]);
        assert_eq!(spec.working_dir.as_deref(), Some("/workdir/repo"));
        assert_eq!(spec.binds, vec!["/tmp/ws:/workdir/swap:rw".to_string()]);
        assert_eq!(spec.user.as_deref(), Some("1000:1000"));
        assert_eq!(spec.network_mode, "none");
        assert!(spec.gpu);
        assert_eq!(spec.labels["featbench.agent"], "trae-agent");
    }

    #[test]
    fn test_exec_output_combined() {
        let out = ExecOutput {
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert!(!out.success());
        assert_eq!(out.combined(), "out\nerr");

        let out = ExecOutput {
            exit_code: 0,
            stdout: "only".to_string(),
            stderr: String::new(),
        };
        assert!(out.success());
        assert_eq!(out.combined(), "only");
    }
}
