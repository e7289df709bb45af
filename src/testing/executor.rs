//! Running the curated test selections inside a task container.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::parser::parse_pytest_output;
use crate::config::HarnessConfig;
use crate::corpus::Instance;
use crate::error::DockerError;
use crate::execution::{shell, ContainerController, ContainerHandle, ExecOutcome, ExecOutput};
use crate::utils::{tail, truncate};

/// Where the instance test patch is uploaded inside the container.
const TEST_PATCH_PATH: &str = "/tmp/featbench-test.patch";

/// Test execution errors. Failing tests are not errors.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error("Test setup failed: {0}")]
    Setup(String),

    #[error("Test run timed out after {0:?}")]
    Timeout(Duration),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),
}

/// Prepares and runs the F2P/P2P selections for one instance.
pub struct TestExecutor<'a> {
    controller: &'a ContainerController,
    config: &'a HarnessConfig,
}

impl<'a> TestExecutor<'a> {
    pub fn new(controller: &'a ContainerController, config: &'a HarnessConfig) -> Self {
        Self { controller, config }
    }

    /// Puts the evaluation tests in place on top of the patched tree.
    ///
    /// Listed test files are restored to the base commit (or removed when
    /// absent there), then the instance test patch is applied. A test patch
    /// that does not apply is a setup failure, not a test failure.
    pub async fn prepare(
        &self,
        handle: &ContainerHandle,
        instance: &Instance,
    ) -> Result<(), TestError> {
        let timeout = self.config.setup_timeout();

        let restore = restore_script(
            &self.config.repo_dir,
            &instance.base_commit,
            &instance.test_files,
        );
        if let Some(script) = restore {
            let output = self.exec(handle, &script, timeout).await?;
            if !output.success() {
                return Err(TestError::Setup(format!(
                    "restoring test files failed: {}",
                    truncate(output.combined().trim(), 1000)
                )));
            }
        }

        if instance.test_patch.trim().is_empty() {
            return Ok(());
        }
        self.controller
            .upload(handle, TEST_PATCH_PATH, instance.test_patch.as_bytes())
            .await?;
        let apply = shell::git(
            &self.config.repo_dir,
            &format!("apply --whitespace=nowarn {}", shell::quote(TEST_PATCH_PATH)),
        );
        let output = self.exec(handle, &apply, timeout).await?;
        if !output.success() {
            return Err(TestError::Setup(format!(
                "test patch does not apply: {}",
                truncate(output.stderr.trim(), 1000)
            )));
        }
        debug!(instance_id = %instance.instance_id, "Test patch applied");
        Ok(())
    }

    /// Runs exactly `test_ids` and returns those that passed.
    ///
    /// An empty selection runs nothing. A runner that crashes before
    /// reporting yields an empty set.
    pub async fn run(
        &self,
        handle: &ContainerHandle,
        instance: &Instance,
        test_ids: &[String],
    ) -> Result<BTreeSet<String>, TestError> {
        if test_ids.is_empty() {
            return Ok(BTreeSet::new());
        }

        let command = instance
            .test_cmd
            .as_deref()
            .unwrap_or(&self.config.test_command);
        let script = test_script(&self.config.repo_dir, command, test_ids);
        let timeout = self.config.test_timeout();
        let output = self.exec(handle, &script, timeout).await?;

        let report = parse_pytest_output(&output.combined());
        if report.is_empty() && !output.success() {
            warn!(
                instance_id = %instance.instance_id,
                exit_code = output.exit_code,
                output = %tail(output.combined().trim(), 1000),
                "Test runner produced no report"
            );
        }

        let passed = report.passed_among(test_ids);
        info!(
            instance_id = %instance.instance_id,
            selected = test_ids.len(),
            reported = report.len(),
            passed = passed.len(),
            "Tests finished"
        );
        Ok(passed)
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, TestError> {
        match self.controller.exec(handle, script, timeout).await? {
            ExecOutcome::Completed(output) => Ok(output),
            ExecOutcome::TimedOut { .. } => Err(TestError::Timeout(timeout)),
        }
    }
}

fn restore_script(repo_dir: &str, base: &str, files: &[String]) -> Option<String> {
    if files.is_empty() {
        return None;
    }
    let steps: Vec<String> = files
        .iter()
        .map(|file| {
            format!(
                "{{ {} 2>/dev/null || rm -f -- {}; }}",
                shell::git(
                    repo_dir,
                    &format!("checkout -q {} -- {}", shell::quote(base), shell::quote(file))
                ),
                shell::quote(&format!("{}/{}", repo_dir.trim_end_matches('/'), file))
            )
        })
        .collect();
    Some(steps.join(" && "))
}

fn test_script(repo_dir: &str, command: &str, test_ids: &[String]) -> String {
    format!(
        "cd {} && {} {}",
        shell::quote(repo_dir),
        command,
        shell::quote_all(test_ids)
    )
}
