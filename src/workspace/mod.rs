//! Per-task scratch directories.
//!
//! Every evaluation task gets its own directory under the work root. It is
//! bind-mounted into the container at the swap path and holds the agent
//! source copy, the problem statement, generated agent configuration and
//! whatever the agent writes back (trajectories, usage reports).
//!
//! Agent sources are fetched once per run and per agent, then copied into
//! each workspace so concurrent tasks never share a writable tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{AgentDescriptor, HarnessConfig};
use crate::corpus::{validate_relative_path, Instance};
use crate::utils::{slugify, tail};

/// Name of the agent source copy inside a workspace.
pub const AGENT_DIR: &str = "agent";

/// Workspace errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to fetch source for agent '{agent}': {reason}")]
    CloneFailed { agent: String, reason: String },

    #[error("Agent source directory not found: {path}")]
    MissingSource { path: String },

    #[error("Invalid workspace path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Creates and hands out task workspaces.
pub struct WorkspaceManager {
    root: PathBuf,
    cache_dir: PathBuf,
    swap_dir: String,
    setup_timeout: Duration,
    sources: Mutex<HashMap<String, Arc<OnceCell<Option<PathBuf>>>>>,
}

impl WorkspaceManager {
    /// Prepares the work root and the agent source cache beneath it.
    pub fn new(config: &HarnessConfig) -> Result<Self, WorkspaceError> {
        let root = config.work_root();
        let cache_dir = root.join("agent-cache");
        std::fs::create_dir_all(&cache_dir)?;
        debug!(root = %root.display(), "Workspace root ready");

        Ok(Self {
            root,
            cache_dir,
            swap_dir: config.swap_dir.clone(),
            setup_timeout: config.setup_timeout(),
            sources: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host directory holding the agent's source, fetched on first use.
    ///
    /// `None` for agents that ship no source (preinstalled command agents).
    pub async fn agent_source(
        &self,
        agent: &AgentDescriptor,
    ) -> Result<Option<PathBuf>, WorkspaceError> {
        let cell = {
            let mut sources = self.sources.lock().await;
            Arc::clone(sources.entry(agent.name.clone()).or_default())
        };
        cell.get_or_try_init(|| self.fetch_source(agent))
            .await
            .cloned()
    }

    async fn fetch_source(&self, agent: &AgentDescriptor) -> Result<Option<PathBuf>, WorkspaceError> {
        if let Some(dir) = &agent.source_dir {
            if !dir.is_dir() {
                return Err(WorkspaceError::MissingSource {
                    path: dir.display().to_string(),
                });
            }
            return Ok(Some(dir.clone()));
        }
        let Some(url) = &agent.repo_url else {
            return Ok(None);
        };

        let dest = self.cache_dir.join(slugify(&agent.name, 60));
        if dest.join(".git").is_dir() {
            debug!(agent = %agent.name, path = %dest.display(), "Reusing cached agent source");
            return Ok(Some(dest));
        }
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await?;
        }

        info!(agent = %agent.name, url = %url, "Cloning agent source");
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--quiet"]);
        if let Some(branch) = &agent.branch {
            cmd.args(["--branch", branch]);
        }
        cmd.arg(url)
            .arg(&dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let failed = |reason: String| WorkspaceError::CloneFailed {
            agent: agent.name.clone(),
            reason,
        };
        let output = match tokio::time::timeout(self.setup_timeout, cmd.output()).await {
            Err(_) => {
                let _ = tokio::fs::remove_dir_all(&dest).await;
                return Err(failed(format!(
                    "git clone timed out after {}s",
                    self.setup_timeout.as_secs()
                )));
            }
            Ok(result) => result.map_err(|e| failed(format!("failed to run git: {e}")))?,
        };
        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(&dest).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(tail(stderr.trim(), 1000)));
        }
        Ok(Some(dest))
    }

    /// Creates a fresh workspace for one (instance, agent) task.
    pub async fn create(
        &self,
        instance: &Instance,
        agent: &AgentDescriptor,
    ) -> Result<Workspace, WorkspaceError> {
        let source = self.agent_source(agent).await?;

        let prefix = format!(
            "{}-{}-",
            slugify(&instance.instance_id, 60),
            slugify(&agent.name, 30)
        );
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.root)?;

        let workspace = Workspace {
            dir,
            swap_dir: self.swap_dir.clone(),
            has_agent: source.is_some(),
        };

        if let Some(source) = source {
            let dest = workspace.path().join(AGENT_DIR);
            let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))??;
            debug!(
                instance_id = %instance.instance_id,
                agent = %agent.name,
                files = copied,
                "Copied agent source into workspace"
            );
        }
        Ok(workspace)
    }
}

/// One task's scratch directory; removed on [`cleanup`](Self::cleanup) or drop.
#[derive(Debug)]
pub struct Workspace {
    dir: tempfile::TempDir,
    swap_dir: String,
    has_agent: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The agent source copy as seen from inside the container.
    pub fn agent_dir(&self) -> Option<String> {
        self.has_agent.then(|| self.container_path(AGENT_DIR))
    }

    /// Maps a workspace-relative path to its location inside the container.
    pub fn container_path(&self, rel: &str) -> String {
        format!("{}/{}", self.swap_dir.trim_end_matches('/'), rel)
    }

    /// Writes `contents` to `rel`, creating parent directories.
    pub fn write_file(&self, rel: &str, contents: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Reads `rel` if it exists.
    pub fn read_file(&self, rel: &str) -> Result<Option<String>, WorkspaceError> {
        let path = self.resolve(rel)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf, WorkspaceError> {
        validate_relative_path(rel).map_err(|e| WorkspaceError::InvalidPath {
            path: rel.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.path().join(rel))
    }

    /// Deletes the directory tree.
    pub fn cleanup(self) {
        let path = self.path().display().to_string();
        if let Err(e) = self.dir.close() {
            warn!(path = %path, error = %e, "Failed to remove workspace");
        }
    }
}

/// Copies `src` into `dest`, skipping `.git`. Returns the number of files.
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<usize> {
    let mut files = 0;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        }
    }
    Ok(files)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> std::io::Result<()> {
    let link = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(_src: &Path, _target: &Path) -> std::io::Result<()> {
    Ok(())
}
