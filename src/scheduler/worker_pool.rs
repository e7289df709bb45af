//! Bounded worker pool that drives evaluation tasks to a recorded result.
//!
//! Tasks are queued up front; `concurrency` workers pull from a shared
//! channel and run one task end to end at a time. Each worker owns at most
//! one container, and the container is released on every exit path before
//! the result is written.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn};

use super::job::{EvaluationTask, TaskProgress, TaskState};
use super::pipeline::{run_phases, PhaseContext, TaskFailure};
use crate::config::{AgentDescriptor, HarnessConfig};
use crate::corpus::Instance;
use crate::evaluation::Verdict;
use crate::execution::ContainerController;
use crate::metrics::HarnessMetrics;
use crate::runner::AgentRegistry;
use crate::storage::{
    EvaluationResult, ResultKey, ResultStatus, ResultsStore, TaskError, TaskErrorKind,
};
use crate::testing::TestOutcomeSet;
use crate::workspace::{WorkspaceError, WorkspaceManager};

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Workspace setup failed: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("No adapter registered for agent '{0}'")]
    UnknownAgent(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,
}

/// How one task ended.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub key: ResultKey,
    pub success: bool,
    pub error_kind: Option<TaskErrorKind>,
    /// The result line reached the store.
    pub recorded: bool,
    pub duration: Duration,
}

/// Per-agent totals in a [`RunSummary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentSummary {
    pub completed: usize,
    pub resolved: usize,
    pub errored: usize,
    pub resolve_rate: f64,
}

/// Totals for one `run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub scheduled: usize,
    /// Pairs already present in the store.
    pub skipped: usize,
    pub completed: usize,
    pub resolved: usize,
    pub errored: BTreeMap<TaskErrorKind, usize>,
    /// Finished but the store write failed; these run again next time.
    pub not_recorded: usize,
    /// Never started because the run was interrupted.
    pub cancelled: usize,
    pub workers: usize,
    /// Mean wall-clock time of the tasks that ran.
    pub average_task_secs: f64,
    pub per_agent: BTreeMap<String, AgentSummary>,
}

impl RunSummary {
    pub fn from_outcomes(scheduled: usize, skipped: usize, outcomes: &[TaskOutcome]) -> Self {
        let mut summary = RunSummary {
            scheduled,
            skipped,
            cancelled: scheduled.saturating_sub(outcomes.len()),
            ..Default::default()
        };
        if !outcomes.is_empty() {
            let total: Duration = outcomes.iter().map(|o| o.duration).sum();
            summary.average_task_secs = total.as_secs_f64() / outcomes.len() as f64;
        }

        for outcome in outcomes {
            let agent = summary
                .per_agent
                .entry(outcome.key.agent.clone())
                .or_default();
            match outcome.error_kind {
                Some(kind) => {
                    *summary.errored.entry(kind).or_default() += 1;
                    agent.errored += 1;
                }
                None => {
                    summary.completed += 1;
                    agent.completed += 1;
                    if outcome.success {
                        summary.resolved += 1;
                        agent.resolved += 1;
                    }
                }
            }
            if !outcome.recorded {
                summary.not_recorded += 1;
            }
        }

        for agent in summary.per_agent.values_mut() {
            let evaluated = agent.completed + agent.errored;
            if evaluated > 0 {
                agent.resolve_rate = agent.resolved as f64 / evaluated as f64;
            }
        }
        summary
    }

    pub fn total_errored(&self) -> usize {
        self.errored.values().sum()
    }
}

/// Stops workers from taking new tasks. Tasks already running finish.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // No receivers just means no workers are running.
        let _ = self.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Everything a worker needs to run a task.
struct TaskRunner {
    config: Arc<HarnessConfig>,
    controller: Arc<ContainerController>,
    workspaces: WorkspaceManager,
    registry: AgentRegistry,
    store: Arc<ResultsStore>,
    metrics: Arc<HarnessMetrics>,
    remaining: AtomicUsize,
}

/// Runs (instance, agent) evaluations over a bounded pool of workers.
pub struct EvaluationScheduler {
    runner: Arc<TaskRunner>,
    shutdown: ShutdownHandle,
    is_running: AtomicBool,
}

impl EvaluationScheduler {
    pub fn new(
        config: Arc<HarnessConfig>,
        controller: Arc<ContainerController>,
        store: Arc<ResultsStore>,
        metrics: Arc<HarnessMetrics>,
    ) -> Result<Self, PoolError> {
        let workspaces = WorkspaceManager::new(&config)?;
        let registry = AgentRegistry::new(&config.agents);
        let (tx, _) = broadcast::channel(1);

        Ok(Self {
            runner: Arc::new(TaskRunner {
                config,
                controller,
                workspaces,
                registry,
                store,
                metrics,
                remaining: AtomicUsize::new(0),
            }),
            shutdown: ShutdownHandle {
                tx,
                stopping: Arc::new(AtomicBool::new(false)),
            },
            is_running: AtomicBool::new(false),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Builds the queue: every instance × agent pair not yet in the store.
    ///
    /// Returns the tasks and the number of pairs skipped.
    pub async fn plan(
        &self,
        instances: &[Instance],
        agents: &[AgentDescriptor],
    ) -> Result<(Vec<EvaluationTask>, usize), PoolError> {
        if let Some(missing) = agents
            .iter()
            .find(|a| self.runner.registry.get(&a.name).is_none())
        {
            return Err(PoolError::UnknownAgent(missing.name.clone()));
        }

        let recorded = self.runner.store.recorded_keys().await;
        Ok(plan_tasks(instances, agents, &recorded))
    }

    /// Evaluates every planned pair and returns the run totals.
    ///
    /// Per-task failures are recorded, never returned.
    pub async fn run(
        &self,
        instances: &[Instance],
        agents: &[AgentDescriptor],
    ) -> Result<RunSummary, PoolError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        let result = self.run_inner(instances, agents).await;
        self.is_running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(
        &self,
        instances: &[Instance],
        agents: &[AgentDescriptor],
    ) -> Result<RunSummary, PoolError> {
        let (tasks, skipped) = self.plan(instances, agents).await?;
        let scheduled = tasks.len();
        info!(
            scheduled = scheduled,
            skipped = skipped,
            workers = self.runner.config.concurrency,
            "Starting evaluation"
        );
        if tasks.is_empty() {
            return Ok(RunSummary::from_outcomes(0, skipped, &[]));
        }

        let (tx, rx) = mpsc::channel(scheduled);
        for task in tasks {
            // Capacity equals the task count, so this never waits.
            if tx.send(task).await.is_err() {
                break;
            }
        }
        drop(tx);
        self.runner.remaining.store(scheduled, Ordering::SeqCst);
        self.runner.metrics.set_queue_depth(scheduled);

        let queue = Arc::new(Mutex::new(rx));
        let num_workers = self.runner.config.concurrency.min(scheduled).max(1);
        let handles: Vec<JoinHandle<Vec<TaskOutcome>>> = (0..num_workers)
            .map(|i| {
                let worker = Worker {
                    id: format!("worker-{i}"),
                    queue: Arc::clone(&queue),
                    runner: Arc::clone(&self.runner),
                    shutdown_rx: self.shutdown.tx.subscribe(),
                    stopping: Arc::clone(&self.shutdown.stopping),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let mut outcomes = Vec::with_capacity(scheduled);
        for handle in handles {
            match handle.await {
                Ok(done) => outcomes.extend(done),
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }
        self.runner.metrics.set_queue_depth(0);

        let summary = RunSummary {
            workers: num_workers,
            ..RunSummary::from_outcomes(scheduled, skipped, &outcomes)
        };
        info!(
            completed = summary.completed,
            resolved = summary.resolved,
            errored = summary.total_errored(),
            cancelled = summary.cancelled,
            average_task_secs = summary.average_task_secs,
            "Evaluation finished"
        );
        Ok(summary)
    }
}

/// Pairs every instance with every agent, dropping recorded pairs.
pub fn plan_tasks(
    instances: &[Instance],
    agents: &[AgentDescriptor],
    recorded: &HashSet<ResultKey>,
) -> (Vec<EvaluationTask>, usize) {
    let agents: Vec<Arc<AgentDescriptor>> = agents.iter().cloned().map(Arc::new).collect();
    let mut tasks = Vec::new();
    let mut skipped = 0;

    for instance in instances {
        let instance = Arc::new(instance.clone());
        for agent in &agents {
            let task = EvaluationTask::new(Arc::clone(&instance), Arc::clone(agent));
            if recorded.contains(&task.key()) {
                debug!(key = %task.key(), "Already recorded, skipping");
                skipped += 1;
            } else {
                tasks.push(task);
            }
        }
    }
    (tasks, skipped)
}

/// A single worker pulling tasks from the shared queue.
struct Worker {
    id: String,
    queue: Arc<Mutex<mpsc::Receiver<EvaluationTask>>>,
    runner: Arc<TaskRunner>,
    shutdown_rx: broadcast::Receiver<()>,
    stopping: Arc<AtomicBool>,
}

impl Worker {
    async fn run(mut self) -> Vec<TaskOutcome> {
        debug!(worker_id = %self.id, "Worker started");
        let mut outcomes = Vec::new();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_))
                | Err(broadcast::error::TryRecvError::Empty) => {}
            }
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let next = self.queue.lock().await.recv().await;
            let Some(task) = next else {
                break;
            };
            let remaining = self
                .runner
                .remaining
                .fetch_sub(1, Ordering::SeqCst)
                .saturating_sub(1);
            self.runner.metrics.set_queue_depth(remaining);

            outcomes.push(self.runner.process(&self.id, task).await);
        }

        debug!(worker_id = %self.id, processed = outcomes.len(), "Worker stopped");
        outcomes
    }
}

impl TaskRunner {
    /// Runs one task to a terminal state and records it.
    async fn process(&self, worker_id: &str, task: EvaluationTask) -> TaskOutcome {
        let started = Instant::now();
        let key = task.key();
        info!(
            worker_id = %worker_id,
            instance_id = %task.instance.instance_id,
            agent = %task.agent.name,
            task_id = %task.id,
            "Processing task"
        );
        if task.instance.has_empty_fail_to_pass() {
            warn!(
                instance_id = %task.instance.instance_id,
                "Instance declares no Fail-to-Pass tests; success_f2p will be vacuous"
            );
        }

        let mut progress = TaskProgress::new();
        let result = self.execute(&task, &mut progress).await;

        let duration = started.elapsed();
        let failed_in = progress.state();
        let (record, final_state) = match &result {
            Ok((verdict, tests)) => (
                self.completed_result(&task, &progress, verdict, tests, duration),
                TaskState::Recorded,
            ),
            Err(failure) => {
                warn!(
                    worker_id = %worker_id,
                    instance_id = %task.instance.instance_id,
                    agent = %task.agent.name,
                    phase = %failed_in,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Task errored"
                );
                if let Err(e) = progress.advance(TaskState::Errored) {
                    error!(key = %key, error = %e, "Unexpected task state");
                }
                (
                    self.errored_result(&task, &progress, failed_in, failure, duration),
                    TaskState::Errored,
                )
            }
        };

        let recorded = match self.store.append(&record).await {
            Ok(()) => {
                if final_state == TaskState::Recorded {
                    if let Err(e) = progress.advance(TaskState::Recorded) {
                        error!(key = %key, error = %e, "Unexpected task state");
                    }
                }
                true
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to record result");
                false
            }
        };

        let status = match (&result, record.success) {
            (Err(_), _) => "errored",
            (Ok(_), true) => "resolved",
            (Ok(_), false) => "unresolved",
        };
        self.metrics.record_task(
            &task.agent.name,
            status,
            duration.as_secs_f64(),
            record.total_tokens,
        );
        info!(
            worker_id = %worker_id,
            instance_id = %task.instance.instance_id,
            agent = %task.agent.name,
            status = status,
            duration_ms = duration.as_millis() as u64,
            "Task finished"
        );

        TaskOutcome {
            key,
            success: record.success,
            error_kind: record.error_kind(),
            recorded,
            duration,
        }
    }

    /// Provisions, runs the phases and releases, all under the task deadline.
    ///
    /// The container and workspace are released here on every path,
    /// including a panic inside a phase.
    async fn execute(
        &self,
        task: &EvaluationTask,
        progress: &mut TaskProgress,
    ) -> Result<(Verdict, TestOutcomeSet), TaskFailure> {
        let limit = self.config.task_timeout();
        let deadline = tokio::time::Instant::now() + limit;

        let adapter = self.registry.get(&task.agent.name).ok_or_else(|| {
            TaskFailure::new(
                TaskErrorKind::Internal,
                format!("no adapter for agent '{}'", task.agent.name),
            )
        })?;
        progress
            .advance(TaskState::Provisioning)
            .map_err(|e| TaskFailure::new(TaskErrorKind::Internal, e.to_string()))?;

        let workspace = timeout_at(
            deadline,
            self.workspaces.create(&task.instance, &task.agent),
        )
        .await
        .map_err(|_| TaskFailure::timeout(limit))??;

        let acquired = AssertUnwindSafe(timeout_at(
            deadline,
            self.controller
                .acquire(&task.instance, &task.agent, &workspace),
        ))
        .catch_unwind()
        .await;
        let handle = match acquired {
            Ok(Ok(Ok(handle))) => handle,
            Ok(Ok(Err(e))) => {
                workspace.cleanup();
                return Err(TaskFailure::provisioning(e));
            }
            Ok(Err(_)) => {
                workspace.cleanup();
                return Err(TaskFailure::timeout(limit));
            }
            Err(panic) => {
                workspace.cleanup();
                return Err(panic_failure(panic));
            }
        };

        let ctx = PhaseContext {
            controller: &self.controller,
            config: &self.config,
            adapter: adapter.as_ref(),
        };
        let phased = AssertUnwindSafe(timeout_at(
            deadline,
            run_phases(&ctx, &handle, &workspace, task, progress),
        ))
        .catch_unwind()
        .await;

        self.controller.release(handle).await;
        workspace.cleanup();

        match phased {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskFailure::timeout(limit)),
            Err(panic) => Err(panic_failure(panic)),
        }
    }

    fn completed_result(
        &self,
        task: &EvaluationTask,
        progress: &TaskProgress,
        verdict: &Verdict,
        tests: &TestOutcomeSet,
        duration: Duration,
    ) -> EvaluationResult {
        EvaluationResult {
            status: ResultStatus::Completed,
            success_f2p: verdict.success_f2p,
            success_p2p: verdict.success_p2p,
            success: verdict.success,
            passed_f2p_tests: tests.passed_f2p.iter().cloned().collect(),
            passed_p2p_tests: tests.passed_p2p.iter().cloned().collect(),
            ..base_result(task, progress, duration)
        }
    }

    fn errored_result(
        &self,
        task: &EvaluationTask,
        progress: &TaskProgress,
        phase: TaskState,
        failure: &TaskFailure,
        duration: Duration,
    ) -> EvaluationResult {
        EvaluationResult {
            error: Some(TaskError {
                kind: failure.kind,
                phase: phase.to_string(),
                message: failure.message.clone(),
            }),
            ..base_result(task, progress, duration)
        }
    }
}

/// An errored, unsuccessful result carrying whatever the task produced.
fn base_result(
    task: &EvaluationTask,
    progress: &TaskProgress,
    duration: Duration,
) -> EvaluationResult {
    EvaluationResult {
        agent: task.agent.name.clone(),
        model: task.agent.model.clone(),
        instance_id: task.instance.instance_id.clone(),
        status: ResultStatus::Errored,
        success_f2p: false,
        success_p2p: false,
        success: false,
        passed_f2p_tests: Vec::new(),
        passed_p2p_tests: Vec::new(),
        total_tokens: progress.total_tokens,
        patch: progress.patch.clone().unwrap_or_default(),
        empty_f2p: task.instance.has_empty_fail_to_pass(),
        agent_exit_code: progress.agent_exit_code,
        error: None,
        duration_secs: duration.as_secs_f64(),
        finished_at: Utc::now(),
    }
}

fn panic_failure(panic: Box<dyn std::any::Any + Send>) -> TaskFailure {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    TaskFailure::new(TaskErrorKind::Internal, format!("panic: {message}"))
}
