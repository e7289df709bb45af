//! File-by-file application of an agent patch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::diff::{split_patch, FileDiff};
use crate::config::HarnessConfig;
use crate::corpus::validate_relative_path;
use crate::error::DockerError;
use crate::execution::{shell, ContainerController, ContainerHandle, ExecOutcome};
use crate::utils::truncate;

/// Directory inside the container that receives per-file diffs.
const PATCH_DIR: &str = "/tmp";

/// Outcome of applying one patch.
///
/// `applied_files` holds exactly the files that applied cleanly, so
/// `applied_files_num == applied_files.len() <= total_files_num`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchApplicationRecord {
    /// Files named by the patch headers, applied or not.
    pub total_files_num: usize,
    pub applied_files_num: usize,
    pub applied_files: Vec<String>,
    /// The patch as produced by the agent.
    pub patch_content: String,
}

/// Patch application errors. Per-file rejections are not errors.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("Patch application timed out after {0:?}")]
    Timeout(Duration),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),
}

/// Applies patches inside a task container with `git apply`.
pub struct PatchApplicator<'a> {
    controller: &'a ContainerController,
    repo_dir: &'a str,
    timeout: Duration,
}

impl<'a> PatchApplicator<'a> {
    pub fn new(controller: &'a ContainerController, config: &'a HarnessConfig) -> Self {
        Self {
            controller,
            repo_dir: &config.repo_dir,
            timeout: config.setup_timeout(),
        }
    }

    /// Applies `patch` one file at a time against the current checkout.
    ///
    /// A file counts as applied only when `git apply` accepts it as is: no
    /// rejected hunks and no fuzz. Files whose paths leave the checkout are
    /// skipped without touching the rest.
    pub async fn apply(
        &self,
        handle: &ContainerHandle,
        patch: &str,
    ) -> Result<PatchApplicationRecord, PatchError> {
        let files = split_patch(patch);
        let mut record = PatchApplicationRecord {
            total_files_num: files.len(),
            patch_content: patch.to_string(),
            ..PatchApplicationRecord::default()
        };
        if files.is_empty() {
            return Ok(record);
        }

        for (index, file) in files.iter().enumerate() {
            if let Err(reason) = check_paths(file) {
                warn!(container = %handle.name(), file = %file.path, reason = %reason, "Skipping file outside the checkout");
                continue;
            }
            if self.apply_file(handle, index, file).await? {
                record.applied_files.push(file.path.clone());
            }
        }
        record.applied_files_num = record.applied_files.len();

        info!(
            container = %handle.name(),
            total = record.total_files_num,
            applied = record.applied_files_num,
            "Patch applied"
        );
        Ok(record)
    }

    async fn apply_file(
        &self,
        handle: &ContainerHandle,
        index: usize,
        file: &FileDiff,
    ) -> Result<bool, PatchError> {
        let diff_path = format!("{PATCH_DIR}/featbench-{index}.diff");
        self.controller
            .upload(handle, &diff_path, file.content.as_bytes())
            .await?;

        let script = apply_script(self.repo_dir, &diff_path);
        match self.controller.exec(handle, &script, self.timeout).await? {
            ExecOutcome::Completed(output) if output.success() => {
                debug!(file = %file.path, "File applied");
                Ok(true)
            }
            ExecOutcome::Completed(output) => {
                debug!(
                    file = %file.path,
                    exit_code = output.exit_code,
                    stderr = %truncate(output.stderr.trim(), 500),
                    "File rejected"
                );
                Ok(false)
            }
            ExecOutcome::TimedOut { .. } => Err(PatchError::Timeout(self.timeout)),
        }
    }
}

fn apply_script(repo_dir: &str, diff_path: &str) -> String {
    shell::git(
        repo_dir,
        &format!(
            "apply --verbose --whitespace=nowarn {}",
            shell::quote(diff_path)
        ),
    )
}

fn check_paths(file: &FileDiff) -> Result<(), String> {
    for path in file.paths() {
        validate_relative_path(path).map_err(|e| e.to_string())?;
    }
    Ok(())
}
