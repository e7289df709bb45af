//! Drives one agent through install, launch and patch capture.

use tracing::{debug, info, warn};

use super::agents::{AgentAdapter, AgentContext, AgentError};
use super::result::{AgentOutcome, TokenUsage};
use crate::execution::{shell, ExecOutcome};
use crate::utils::truncate;

/// Stages everything the agent touched and diffs it against `base`.
///
/// Staging first picks up untracked files; diffing against the base commit
/// picks up anything the agent committed.
fn capture_script(repo_dir: &str, base: &str) -> String {
    format!(
        "{} && {}",
        shell::git(repo_dir, "add -A"),
        shell::git(
            repo_dir,
            &format!("diff --cached --binary {}", shell::quote(base))
        )
    )
}

/// Returns the checkout to `base` with no untracked files.
fn reset_script(repo_dir: &str, base: &str) -> String {
    format!(
        "{} && {}",
        shell::git(repo_dir, &format!("reset -q --hard {}", shell::quote(base))),
        shell::git(repo_dir, "clean -fdq")
    )
}

/// Runs the agent and returns its usage and patch.
///
/// A timed-out agent yields no patch: its tree may be mid-edit. An agent
/// that exits nonzero yields an empty patch and zero tokens; its exit code
/// is kept. Otherwise the diff is captured, and in every completed case the
/// checkout is reset to the base commit so patch application starts from a
/// pristine tree.
pub async fn run_agent(
    adapter: &dyn AgentAdapter,
    ctx: &AgentContext<'_>,
) -> Result<AgentOutcome, AgentError> {
    let name = &adapter.descriptor().name;
    let instance_id = &ctx.instance.instance_id;

    adapter.prepare_agent_code(ctx).await?;
    adapter.prepare_resources(ctx).await?;
    let mut run = adapter.evaluate(ctx).await?;

    if run.timed_out {
        return Ok(AgentOutcome {
            run,
            patch: String::new(),
        });
    }

    let patch = if run.exit_code == Some(0) {
        capture_patch(ctx).await?
    } else {
        warn!(
            instance_id = %instance_id,
            agent = %name,
            exit_code = ?run.exit_code,
            discarded_tokens = run.usage.total(),
            "Agent failed, discarding its changes"
        );
        run.usage = TokenUsage::default();
        String::new()
    };
    info!(
        instance_id = %instance_id,
        agent = %name,
        exit_code = ?run.exit_code,
        tokens = run.usage.total(),
        patch_bytes = patch.len(),
        "Agent finished"
    );

    reset_checkout(ctx).await?;
    Ok(AgentOutcome { run, patch })
}

async fn capture_patch(ctx: &AgentContext<'_>) -> Result<String, AgentError> {
    let script = capture_script(&ctx.config.repo_dir, &ctx.instance.base_commit);
    let timeout = ctx.config.setup_timeout();
    match ctx.controller.exec(ctx.handle, &script, timeout).await? {
        ExecOutcome::Completed(output) if output.success() => {
            debug!(instance_id = %ctx.instance.instance_id, "Captured working-tree diff");
            Ok(output.stdout)
        }
        ExecOutcome::Completed(output) => {
            warn!(
                instance_id = %ctx.instance.instance_id,
                exit_code = output.exit_code,
                stderr = %truncate(output.stderr.trim(), 500),
                "Diff capture failed, treating patch as empty"
            );
            Ok(String::new())
        }
        ExecOutcome::TimedOut { .. } => {
            warn!(instance_id = %ctx.instance.instance_id, "Diff capture timed out, treating patch as empty");
            Ok(String::new())
        }
    }
}

async fn reset_checkout(ctx: &AgentContext<'_>) -> Result<(), AgentError> {
    let script = reset_script(&ctx.config.repo_dir, &ctx.instance.base_commit);
    let timeout = ctx.config.setup_timeout();
    let output = ctx
        .controller
        .exec(ctx.handle, &script, timeout)
        .await?
        .completed(timeout)?;
    if !output.success() {
        return Err(AgentError::Setup(format!(
            "reset to {} failed: {}",
            ctx.instance.base_commit,
            truncate(output.combined().trim(), 1000)
        )));
    }
    Ok(())
}
