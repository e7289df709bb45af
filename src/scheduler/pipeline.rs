//! The in-container phases of one evaluation task.

use std::time::Duration;

use tracing::{debug, info};

use super::job::{EvaluationTask, TaskProgress, TaskState};
use crate::config::HarnessConfig;
use crate::error::DockerError;
use crate::evaluation::{classify, Verdict};
use crate::execution::{ContainerController, ContainerHandle};
use crate::patch::{PatchApplicator, PatchError};
use crate::runner::{run_agent, AgentAdapter, AgentContext, AgentError};
use crate::storage::TaskErrorKind;
use crate::testing::{TestError, TestExecutor, TestOutcomeSet};
use crate::workspace::{Workspace, WorkspaceError};

/// A per-task failure, classified for the result record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            TaskErrorKind::Timeout,
            format!("exceeded {}s", limit.as_secs()),
        )
    }

    /// A Docker failure while the container was being provisioned.
    pub fn provisioning(err: DockerError) -> Self {
        match err {
            DockerError::Timeout { seconds } => Self::timeout(Duration::from_secs(seconds)),
            other => Self::new(TaskErrorKind::Provisioning, other.to_string()),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<DockerError> for TaskFailure {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::Timeout { seconds } => Self::timeout(Duration::from_secs(seconds)),
            other => Self::new(TaskErrorKind::Infrastructure, other.to_string()),
        }
    }
}

impl From<WorkspaceError> for TaskFailure {
    fn from(err: WorkspaceError) -> Self {
        Self::new(TaskErrorKind::Provisioning, err.to_string())
    }
}

impl From<AgentError> for TaskFailure {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Timeout(limit) => Self::timeout(limit),
            AgentError::Docker(e) => e.into(),
            AgentError::Workspace(e) => Self::new(TaskErrorKind::Infrastructure, e.to_string()),
            other => Self::new(TaskErrorKind::Infrastructure, other.to_string()),
        }
    }
}

impl From<PatchError> for TaskFailure {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::Timeout(limit) => Self::timeout(limit),
            PatchError::Docker(e) => e.into(),
        }
    }
}

impl From<TestError> for TaskFailure {
    fn from(err: TestError) -> Self {
        match err {
            TestError::Timeout(limit) => Self::timeout(limit),
            TestError::Setup(msg) => Self::new(TaskErrorKind::Infrastructure, msg),
            TestError::Docker(e) => e.into(),
        }
    }
}

/// Shared inputs of the in-container phases.
pub struct PhaseContext<'a> {
    pub controller: &'a ContainerController,
    pub config: &'a HarnessConfig,
    pub adapter: &'a dyn AgentAdapter,
}

/// Runs agent, patch application, tests and classification on an acquired
/// container.
///
/// `progress` is updated as each phase lands so the caller still sees the
/// tokens and patch record when this future is cancelled.
pub async fn run_phases(
    ctx: &PhaseContext<'_>,
    handle: &ContainerHandle,
    workspace: &Workspace,
    task: &EvaluationTask,
    progress: &mut TaskProgress,
) -> Result<(Verdict, TestOutcomeSet), TaskFailure> {
    let instance = task.instance.as_ref();
    let agent = task.agent.name.as_str();

    advance(progress, TaskState::RunningAgent)?;
    let agent_ctx = AgentContext {
        controller: ctx.controller,
        handle,
        workspace,
        instance,
        config: ctx.config,
    };
    let outcome = run_agent(ctx.adapter, &agent_ctx).await?;
    progress.total_tokens = outcome.total_tokens();
    progress.agent_exit_code = outcome.run.exit_code;
    if outcome.timed_out() {
        return Err(TaskFailure::timeout(ctx.config.agent_timeout()));
    }

    advance(progress, TaskState::ApplyingPatch)?;
    let record = PatchApplicator::new(ctx.controller, ctx.config)
        .apply(handle, &outcome.patch)
        .await?;
    info!(
        instance_id = %instance.instance_id,
        agent = %agent,
        total_files = record.total_files_num,
        applied_files = record.applied_files_num,
        "Patch applied"
    );
    progress.patch = Some(record);

    advance(progress, TaskState::Testing)?;
    let tests = TestExecutor::new(ctx.controller, ctx.config);
    tests.prepare(handle, instance).await?;
    let outcomes = TestOutcomeSet {
        passed_f2p: tests.run(handle, instance, &instance.fail_to_pass).await?,
        passed_p2p: tests.run(handle, instance, &instance.pass_to_pass).await?,
    };

    let verdict = classify(
        &instance.fail_to_pass,
        &instance.pass_to_pass,
        &outcomes.passed_f2p,
        &outcomes.passed_p2p,
    );
    advance(progress, TaskState::Classified)?;
    debug!(
        instance_id = %instance.instance_id,
        agent = %agent,
        success_f2p = verdict.success_f2p,
        success_p2p = verdict.success_p2p,
        "Classified"
    );
    Ok((verdict, outcomes))
}

fn advance(progress: &mut TaskProgress, next: TaskState) -> Result<(), TaskFailure> {
    progress
        .advance(next)
        .map_err(|e| TaskFailure::new(TaskErrorKind::Internal, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_map_to_timeout_kind() {
        let limit = Duration::from_secs(5);
        let failures = [
            TaskFailure::from(AgentError::Timeout(limit)),
            TaskFailure::from(PatchError::Timeout(limit)),
            TaskFailure::from(TestError::Timeout(limit)),
            TaskFailure::from(DockerError::Timeout { seconds: 5 }),
            TaskFailure::provisioning(DockerError::Timeout { seconds: 5 }),
        ];
        for failure in failures {
            assert_eq!(failure.kind, TaskErrorKind::Timeout);
            assert_eq!(failure.message, "exceeded 5s");
        }
    }

    #[test]
    fn test_provisioning_vs_infrastructure() {
        let missing = DockerError::ImageNotFound {
            image: "featbench_a_b:1".to_string(),
        };
        assert_eq!(
            TaskFailure::provisioning(missing).kind,
            TaskErrorKind::Provisioning
        );

        let gone = DockerError::ContainerNotFound {
            id: "abc".to_string(),
        };
        assert_eq!(TaskFailure::from(gone).kind, TaskErrorKind::Infrastructure);

        let install = AgentError::Install {
            command: "pip install -e .".to_string(),
            exit_code: 1,
            stderr: "no setup.py".to_string(),
        };
        assert_eq!(
            TaskFailure::from(install).kind,
            TaskErrorKind::Infrastructure
        );

        let setup = TestError::Setup("test patch does not apply".to_string());
        let failure = TaskFailure::from(setup);
        assert_eq!(failure.kind, TaskErrorKind::Infrastructure);
        assert_eq!(failure.to_string(), "infrastructure: test patch does not apply");
    }

    #[test]
    fn test_workspace_failure_is_provisioning() {
        let err = WorkspaceError::MissingSource {
            path: "/nope".to_string(),
        };
        assert_eq!(TaskFailure::from(err).kind, TaskErrorKind::Provisioning);
    }
}
