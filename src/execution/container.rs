//! Container lifecycle control for evaluation tasks.
//!
//! [`ContainerController::acquire`] hands out a [`ContainerHandle`] for a
//! ready container; [`ContainerController::release`] consumes it. A handle
//! that is dropped without being released (task cancelled, worker panicked)
//! removes its container from `Drop`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AgentDescriptor, HarnessConfig};
use crate::corpus::Instance;
use crate::error::DockerError;
use crate::execution::images::{ensure_image, local_image_name};
use crate::execution::runtime::{ContainerRuntime, ContainerSpec, ExecOutput};
use crate::execution::shell;
use crate::metrics::HarnessMetrics;
use crate::utils::{slugify, truncate};
use crate::workspace::Workspace;

/// Number of readiness probes before a container is declared dead.
const READINESS_PROBES: u32 = 12;

/// Delay between readiness probes.
const READINESS_INTERVAL: Duration = Duration::from_millis(500);

/// Extra time the client waits past `timeout + kill grace` before giving up
/// on an exec whose in-container `timeout` did not fire.
const EXEC_SLACK: Duration = Duration::from_secs(2);

/// Limits for one bounded exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExecTiming {
    /// Seconds passed to `timeout`.
    secs: u64,
    /// Seconds between TERM and KILL.
    grace: u64,
    /// When the client stops waiting for the daemon.
    deadline: Duration,
}

/// The client deadline covers the full in-container kill sequence.
fn exec_timing(timeout: Duration, kill_grace_secs: u64) -> ExecTiming {
    let secs = timeout.as_secs().max(1);
    let grace = kill_grace_secs.max(1);
    ExecTiming {
        secs,
        grace,
        deadline: Duration::from_secs(secs + grace) + EXEC_SLACK,
    }
}

/// Exclusive handle to one running evaluation container.
pub struct ContainerHandle {
    id: String,
    name: String,
    image: String,
    runtime: Arc<dyn ContainerRuntime>,
    keep: bool,
    released: bool,
}

impl ContainerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("image", &self.image)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.released || self.keep {
            return;
        }
        warn!(container = %self.name, "Container handle dropped without release, removing");

        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let runtime = Arc::clone(&self.runtime);
                rt.spawn(async move {
                    if let Err(e) = runtime.remove_container(&id).await {
                        error!(container = %id, error = %e, "Backstop container removal failed");
                    }
                });
            }
            Err(_) => {
                // No runtime left (process shutting down); fall back to the CLI.
                std::thread::spawn(move || {
                    let _ = std::process::Command::new("docker")
                        .args(["rm", "-f", "-v", &id])
                        .stdout(std::process::Stdio::null())
                        .stderr(std::process::Stdio::null())
                        .status();
                });
            }
        }
    }
}

/// Result of a bounded exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The command finished on its own.
    Completed(ExecOutput),
    /// The command hit its wall-clock limit and was killed.
    TimedOut { elapsed: Duration },
}

impl ExecOutcome {
    /// Converts a timeout into `DockerError::Timeout`.
    pub fn completed(self, limit: Duration) -> Result<ExecOutput, DockerError> {
        match self {
            ExecOutcome::Completed(output) => Ok(output),
            ExecOutcome::TimedOut { .. } => Err(DockerError::Timeout {
                seconds: limit.as_secs(),
            }),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecOutcome::TimedOut { .. })
    }
}

/// Collision-free container name for one evaluation task.
pub fn container_name(instance_id: &str, agent: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "featbench-{}-{}-{}",
        slugify(instance_id, 80),
        slugify(agent, 40),
        &suffix[..8]
    )
}

fn same_commit(head: &str, base: &str) -> bool {
    !head.is_empty() && !base.is_empty() && (head.starts_with(base) || base.starts_with(head))
}

/// Creates, probes, runs commands in and removes evaluation containers.
pub struct ContainerController {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<HarnessConfig>,
    metrics: Arc<HarnessMetrics>,
}

impl ContainerController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<HarnessConfig>,
        metrics: Arc<HarnessMetrics>,
    ) -> Self {
        Self {
            runtime,
            config,
            metrics,
        }
    }

    /// Runs `op`, retrying transient Docker errors with doubling backoff.
    async fn with_retries<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, DockerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DockerError>>,
    {
        let attempts = self.config.provision_retries.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.config.retry_backoff(attempt);
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "Transient Docker error, retrying"
                    );
                    self.metrics.provision_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Starts a container for `instance` with the repository at its base
    /// commit and `workspace` mounted at the swap directory.
    ///
    /// On any failure after creation the container is removed before the
    /// error is returned.
    pub async fn acquire(
        &self,
        instance: &Instance,
        agent: &AgentDescriptor,
        workspace: &Workspace,
    ) -> Result<ContainerHandle, DockerError> {
        let image = local_image_name(instance);
        let runtime = self.runtime.as_ref();
        let registry = self.config.registry_prefix.as_str();

        let status = self
            .with_retries("ensure_image", || ensure_image(runtime, &image, registry))
            .await?;
        debug!(instance_id = %instance.instance_id, image = %image, status = ?status, "Image ready");

        let name = container_name(&instance.instance_id, &agent.name);
        let host_path = workspace.path().display().to_string();
        let spec = ContainerSpec::new(&name, &image)
            .with_working_dir(&self.config.repo_dir)
            .with_limits(self.config.limits.clone())
            .with_bind(&host_path, &self.config.swap_dir)
            .with_user(self.exec_user(workspace))
            .with_network_mode(&self.config.network_mode)
            .with_gpu(self.config.gpu)
            .with_label("featbench.instance", &instance.instance_id)
            .with_label("featbench.agent", &agent.name);

        let spec_ref = &spec;
        let name_ref = name.as_str();
        let id = self
            .with_retries("create_container", || async move {
                // A failed earlier attempt may have left a container with this name.
                let _ = runtime.remove_container(name_ref).await;
                runtime.create_container(spec_ref).await
            })
            .await?;

        let handle = ContainerHandle {
            id,
            name,
            image,
            runtime: Arc::clone(&self.runtime),
            keep: self.config.keep_containers,
            released: false,
        };
        self.metrics.container_started();

        let id_ref = handle.id.as_str();
        let started = self
            .with_retries("start_container", || runtime.start_container(id_ref))
            .await;
        if let Err(e) = started {
            self.release(handle).await;
            return Err(e);
        }

        let prepared = self.prepare_checkout(&handle, instance).await;
        if let Err(e) = prepared {
            self.release(handle).await;
            return Err(e);
        }

        info!(
            instance_id = %instance.instance_id,
            agent = %agent.name,
            container = %handle.name,
            "Container ready"
        );
        Ok(handle)
    }

    /// `uid:gid` owning the workspace, so files the container writes into
    /// the mount stay removable by the host user.
    #[cfg(unix)]
    fn exec_user(&self, workspace: &Workspace) -> Option<String> {
        use std::os::unix::fs::MetadataExt;

        if !self.config.run_as_host_user {
            return None;
        }
        std::fs::metadata(workspace.path())
            .ok()
            .map(|meta| format!("{}:{}", meta.uid(), meta.gid()))
    }

    #[cfg(not(unix))]
    fn exec_user(&self, _workspace: &Workspace) -> Option<String> {
        None
    }

    /// Polls the checkout until git answers, then pins it to the base commit.
    async fn prepare_checkout(
        &self,
        handle: &ContainerHandle,
        instance: &Instance,
    ) -> Result<(), DockerError> {
        let repo = &self.config.repo_dir;
        let probe = shell::git(repo, "rev-parse HEAD");
        let probe_timeout = Duration::from_secs(30);

        let mut head = None;
        let mut last_failure = String::new();
        for attempt in 1..=READINESS_PROBES {
            match self.exec(handle, &probe, probe_timeout).await {
                Ok(ExecOutcome::Completed(out)) if out.success() => {
                    head = Some(out.stdout.trim().to_string());
                    break;
                }
                Ok(ExecOutcome::Completed(out)) => last_failure = truncate(&out.combined(), 500),
                Ok(ExecOutcome::TimedOut { .. }) => last_failure = "probe timed out".to_string(),
                Err(e @ DockerError::ContainerNotFound { .. }) => return Err(e),
                Err(e) => last_failure = e.to_string(),
            }
            debug!(container = %handle.name, attempt = attempt, "Container not ready yet");
            tokio::time::sleep(READINESS_INTERVAL).await;
        }

        let Some(head) = head else {
            return Err(DockerError::NotReady {
                id: handle.name.clone(),
                attempts: READINESS_PROBES,
                reason: last_failure,
            });
        };

        if same_commit(&head, &instance.base_commit) {
            return Ok(());
        }

        info!(
            instance_id = %instance.instance_id,
            head = %head,
            base_commit = %instance.base_commit,
            "Checking out base commit"
        );
        let checkout = format!(
            "{} && {}",
            shell::git(
                repo,
                &format!("checkout -q -f {}", shell::quote(&instance.base_commit))
            ),
            shell::git(repo, "clean -fdq")
        );
        let output = self
            .exec(handle, &checkout, self.config.setup_timeout())
            .await?
            .completed(self.config.setup_timeout())?;
        if !output.success() {
            return Err(DockerError::RunFailed(format!(
                "checkout of {} failed: {}",
                instance.base_commit,
                truncate(&output.combined(), 1000)
            )));
        }
        Ok(())
    }

    /// Runs `script` with `bash -lc` under a hard wall-clock limit.
    pub async fn exec(
        &self,
        handle: &ContainerHandle,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutcome, DockerError> {
        self.exec_with_env(handle, script, timeout, Vec::new()).await
    }

    /// Like [`exec`](Self::exec) with extra `KEY=VALUE` environment entries.
    ///
    /// The command runs under coreutils `timeout`, which signals the whole
    /// process group on expiry and escalates to SIGKILL after the configured
    /// grace. The client gives up shortly after that even if the daemon
    /// never returns.
    pub async fn exec_with_env(
        &self,
        handle: &ContainerHandle,
        script: &str,
        timeout: Duration,
        env: Vec<String>,
    ) -> Result<ExecOutcome, DockerError> {
        let ExecTiming { secs, grace, deadline } = exec_timing(timeout, self.config.kill_grace_secs);
        let cmd = vec![
            "timeout".to_string(),
            "-k".to_string(),
            format!("{grace}s"),
            format!("{secs}s"),
            "bash".to_string(),
            "-lc".to_string(),
            script.to_string(),
        ];

        let started = Instant::now();
        match tokio::time::timeout(deadline, self.runtime.exec(&handle.id, cmd, env)).await {
            Err(_) => {
                warn!(
                    container = %handle.name,
                    timeout_secs = secs,
                    "Exec did not return before the deadline"
                );
                Ok(ExecOutcome::TimedOut {
                    elapsed: started.elapsed(),
                })
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(output)) => {
                let elapsed = started.elapsed();
                // 124: TERM delivered; 137: escalated to KILL.
                if matches!(output.exit_code, 124 | 137) && elapsed >= Duration::from_secs(secs) {
                    warn!(container = %handle.name, timeout_secs = secs, "Command timed out");
                    Ok(ExecOutcome::TimedOut { elapsed })
                } else {
                    Ok(ExecOutcome::Completed(output))
                }
            }
        }
    }

    /// Writes a file into the container.
    pub async fn upload(
        &self,
        handle: &ContainerHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), DockerError> {
        self.runtime.upload_file(&handle.id, path, contents).await
    }

    /// Removes the container and its anonymous volumes, then checks that
    /// the daemon no longer knows it.
    ///
    /// Never fails: removal errors are retried, then logged. Returns whether
    /// the container was confirmed absent.
    pub async fn release(&self, mut handle: ContainerHandle) -> bool {
        handle.released = true;
        self.metrics.container_released();

        if handle.keep {
            info!(container = %handle.name, "Keeping container for debugging");
            return false;
        }

        let attempts = self.config.provision_retries.max(1);
        for attempt in 1..=attempts {
            let outcome = match self.runtime.remove_container(&handle.id).await {
                Ok(()) => self.runtime.container_exists(&handle.id).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(false) => {
                    debug!(container = %handle.name, "Container removed");
                    return true;
                }
                Ok(true) if attempt < attempts => {
                    warn!(container = %handle.name, attempt = attempt, "Container still present after removal, retrying");
                    tokio::time::sleep(self.config.retry_backoff(attempt)).await;
                }
                Err(e) if attempt < attempts => {
                    warn!(container = %handle.name, attempt = attempt, error = %e, "Container removal failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff(attempt)).await;
                }
                Ok(true) => {
                    error!(container = %handle.name, "Container still present after removal, manual cleanup needed");
                }
                Err(e) => {
                    error!(container = %handle.name, error = %e, "Container removal failed, manual cleanup needed");
                }
            }
        }
        false
    }
}
