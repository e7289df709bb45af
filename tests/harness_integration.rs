//! Scheduler-level tests against an in-memory container runtime.
//!
//! The fake runtime answers exec calls by matching substrings of the script,
//! records every container it creates and removes, and can hang or panic on
//! demand. Docker is only needed for the ignored tests at the bottom.
//! Run those with: cargo test --test harness_integration -- --ignored

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use featbench::config::{AgentDescriptor, HarnessConfig};
use featbench::corpus::Instance;
use featbench::error::DockerError;
use featbench::execution::{ContainerController, ContainerRuntime, ContainerSpec, ExecOutput};
use featbench::metrics::HarnessMetrics;
use featbench::runner::AgentKind;
use featbench::scheduler::{EvaluationScheduler, RunSummary};
use featbench::storage::{
    load_results, EvaluationResult, ResultStatus, ResultsStore, TaskErrorKind,
};
use featbench::workspace::WorkspaceManager;

const BASE: &str = "abc1234";

#[derive(Clone)]
enum Reply {
    Output { exit_code: i64, stdout: String },
    Fail,
    Hang,
    Panic,
}

impl Reply {
    fn ok(stdout: &str) -> Self {
        Reply::Output {
            exit_code: 0,
            stdout: stdout.to_string(),
        }
    }

    fn exit(code: i64) -> Self {
        Reply::Output {
            exit_code: code,
            stdout: String::new(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    live: HashSet<String>,
    created: Vec<String>,
    removed: Vec<String>,
    host_dirs: HashMap<String, PathBuf>,
    uploads: HashMap<(String, String), Vec<u8>>,
    scripts: Vec<String>,
    create_attempts: usize,
}

/// Scriptable stand-in for the Docker daemon.
#[derive(Default)]
struct FakeRuntime {
    state: Mutex<FakeState>,
    rules: Vec<(String, Reply)>,
    agent_patch: String,
    passing: Vec<String>,
    usage_tokens: Option<u64>,
    agent_exit: i64,
    fail_start: bool,
    /// Leading `create_container` calls that fail with a daemon hiccup.
    transient_creates: usize,
    /// Removal succeeds but the container stays listed.
    sticky_removal: bool,
}

impl FakeRuntime {
    fn new() -> Self {
        Self::default()
    }

    fn with_patch(mut self, patch: &str) -> Self {
        self.agent_patch = patch.to_string();
        self
    }

    fn with_passing(mut self, ids: &[&str]) -> Self {
        self.passing = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    fn with_usage(mut self, tokens: u64) -> Self {
        self.usage_tokens = Some(tokens);
        self
    }

    fn agent_exits_with(mut self, code: i64) -> Self {
        self.agent_exit = code;
        self
    }

    fn flaky_create(mut self, failures: usize) -> Self {
        self.transient_creates = failures;
        self
    }

    fn sticky_removal(mut self) -> Self {
        self.sticky_removal = true;
        self
    }

    fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Scripts containing `needle` get `reply` instead of the default.
    fn on(mut self, needle: &str, reply: Reply) -> Self {
        self.rules.push((needle.to_string(), reply));
        self
    }

    fn created(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    fn live(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    fn removed(&self) -> usize {
        self.state.lock().unwrap().removed.len()
    }

    fn create_attempts(&self) -> usize {
        self.state.lock().unwrap().create_attempts
    }

    fn ran(&self, needle: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .scripts
            .iter()
            .any(|s| s.contains(needle))
    }

    fn default_reply(&self, id: &str, script: &str) -> Reply {
        if script.contains("rev-parse HEAD") {
            return Reply::ok(&format!("{BASE}\n"));
        }
        if script.contains("run-agent") {
            if let Some(tokens) = self.usage_tokens {
                let dir = self.state.lock().unwrap().host_dirs.get(id).cloned();
                if let Some(dir) = dir {
                    let usage = format!("{{\"total_tokens\": {tokens}}}");
                    std::fs::write(dir.join("usage.json"), usage).unwrap();
                }
            }
            return Reply::exit(self.agent_exit);
        }
        if script.contains("diff --cached") {
            return Reply::ok(&self.agent_patch);
        }
        if script.contains("apply --verbose") {
            let state = self.state.lock().unwrap();
            let rejected = state
                .uploads
                .iter()
                .filter(|((cid, path), _)| cid == id && script.contains(path.as_str()))
                .any(|(_, body)| String::from_utf8_lossy(body).contains("REJECT"));
            return Reply::exit(if rejected { 1 } else { 0 });
        }
        if script.contains("pytest") {
            let report: String = self
                .passing
                .iter()
                .filter(|t| script.contains(t.as_str()))
                .map(|t| format!("PASSED {t}\n"))
                .collect();
            return Reply::ok(&report);
        }
        Reply::ok("")
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), DockerError> {
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, DockerError> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> Result<(), DockerError> {
        Ok(())
    }

    async fn tag_image(&self, _source: &str, _target: &str) -> Result<(), DockerError> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let mut state = self.state.lock().unwrap();
        state.create_attempts += 1;
        if state.create_attempts <= self.transient_creates {
            return Err(DockerError::DaemonUnavailable("connection refused".to_string()));
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.live.insert(id.clone());
        state.created.push(spec.name.clone());
        if let Some(host) = spec.binds.first().and_then(|b| b.split(':').next()) {
            state.host_dirs.insert(id.clone(), PathBuf::from(host));
        }
        Ok(id)
    }

    async fn start_container(&self, _id: &str) -> Result<(), DockerError> {
        if self.fail_start {
            return Err(DockerError::RunFailed("image has no /bin/bash".to_string()));
        }
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        _env: Vec<String>,
    ) -> Result<ExecOutput, DockerError> {
        let script = cmd.last().cloned().unwrap_or_default();
        self.state.lock().unwrap().scripts.push(script.clone());

        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply(id, &script));

        match reply {
            Reply::Output { exit_code, stdout } => Ok(ExecOutput {
                exit_code,
                stdout,
                stderr: String::new(),
            }),
            Reply::Fail => Err(DockerError::ContainerNotFound { id: id.to_string() }),
            Reply::Hang => std::future::pending().await,
            Reply::Panic => panic!("injected panic"),
        }
    }

    async fn upload_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), DockerError> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .insert((id.to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let mut state = self.state.lock().unwrap();
        if !self.sticky_removal {
            state.live.remove(id);
        }
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn container_exists(&self, id: &str) -> Result<bool, DockerError> {
        Ok(self.state.lock().unwrap().live.contains(id))
    }
}

fn scripted_agent() -> AgentDescriptor {
    AgentDescriptor {
        name: "scripted".to_string(),
        kind: AgentKind::Command,
        model: "test-model".to_string(),
        provider: "test".to_string(),
        repo_url: None,
        branch: None,
        install_commands: Vec::new(),
        run_command: Some("run-agent {problem_file}".to_string()),
        env_passthrough: Vec::new(),
        ..AgentDescriptor::trae_default()
    }
}

fn test_config(root: &Path) -> HarnessConfig {
    HarnessConfig {
        concurrency: 2,
        agent_timeout_secs: 1,
        test_timeout_secs: 5,
        setup_timeout_secs: 5,
        task_timeout_secs: 30,
        kill_grace_secs: 0,
        provision_retries: 1,
        retry_backoff_secs: 0,
        work_root: Some(root.join("work")),
        run_as_host_user: false,
        agents: vec![scripted_agent()],
        ..HarnessConfig::default()
    }
}

fn file_diff(path: &str, added: &str) -> String {
    format!(
        "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -1 +1,2 @@\n x = 1\n+{added}\n"
    )
}

fn instance(id: &str, f2p: &[&str], p2p: &[&str]) -> Instance {
    let mut instance = Instance::new(id, "owner/repo", BASE);
    instance.problem_statement = "Add a flag".to_string();
    instance.fail_to_pass = f2p.iter().map(|s| s.to_string()).collect();
    instance.pass_to_pass = p2p.iter().map(|s| s.to_string()).collect();
    instance
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    output: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        Self {
            output: root.join("results.jsonl"),
            root,
            _dir: dir,
        }
    }

    async fn run(
        &self,
        runtime: Arc<FakeRuntime>,
        config: HarnessConfig,
        instances: &[Instance],
    ) -> RunSummary {
        let config = Arc::new(config);
        let metrics = Arc::new(HarnessMetrics::new().unwrap());
        let controller = Arc::new(ContainerController::new(
            runtime,
            Arc::clone(&config),
            Arc::clone(&metrics),
        ));
        let store = Arc::new(ResultsStore::open(&self.output).await.unwrap());
        let scheduler =
            EvaluationScheduler::new(Arc::clone(&config), controller, store, metrics).unwrap();
        scheduler.run(instances, &config.agents).await.unwrap()
    }

    async fn results(&self) -> Vec<EvaluationResult> {
        load_results(&self.output).await.unwrap()
    }

    async fn only_result(&self) -> EvaluationResult {
        let mut results = self.results().await;
        assert_eq!(results.len(), 1, "expected exactly one result");
        results.remove(0)
    }
}

#[tokio::test]
async fn test_scenario_empty_f2p_all_applied() {
    let harness = Harness::new();
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_patch(&file_diff("src/flag.py", "FLAG = True"))
            .with_passing(&["tests/test_a.py::test_one", "tests/test_a.py::test_two"])
            .with_usage(4200),
    );
    let instances = [instance(
        "owner__repo-1",
        &[],
        &["tests/test_a.py::test_one", "tests/test_a.py::test_two"],
    )];

    let summary = harness
        .run(Arc::clone(&runtime), test_config(&harness.root), &instances)
        .await;
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.resolved, 1);

    let result = harness.only_result().await;
    assert!(result.success_f2p && result.success_p2p && result.success);
    assert!(result.empty_f2p);
    assert_eq!(result.patch.total_files_num, 1);
    assert_eq!(result.patch.applied_files_num, 1);
    assert_eq!(result.patch.applied_files, vec!["src/flag.py"]);
    assert_eq!(result.passed_p2p_tests.len(), 2);
    assert_eq!(result.total_tokens, 4200);
    assert!(result.error.is_none());
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_scenario_partial_patch_is_reported() {
    let harness = Harness::new();
    let patch = format!(
        "{}{}{}",
        file_diff("a.py", "A = 1"),
        file_diff("b.py", "REJECT = 1"),
        file_diff("c.py", "C = 1")
    );
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_patch(&patch)
            .with_passing(&["tests/test_new.py::test_feature", "tests/test_old.py::test_keep"]),
    );
    let instances = [instance(
        "owner__repo-2",
        &["tests/test_new.py::test_feature"],
        &["tests/test_old.py::test_keep"],
    )];

    harness
        .run(Arc::clone(&runtime), test_config(&harness.root), &instances)
        .await;

    let result = harness.only_result().await;
    assert_eq!(result.patch.total_files_num, 3);
    assert_eq!(result.patch.applied_files_num, 2);
    assert_eq!(result.patch.applied_files, vec!["a.py", "c.py"]);
    assert_eq!(result.patch.patch_content, patch);
    assert!(result.success);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_scenario_agent_timeout() {
    let harness = Harness::new();
    let runtime = Arc::new(FakeRuntime::new().on("run-agent", Reply::Hang));
    let instances = [instance("owner__repo-3", &["tests/t.py::test_x"], &[])];

    let started = Instant::now();
    let summary = harness
        .run(Arc::clone(&runtime), test_config(&harness.root), &instances)
        .await;
    // agent timeout (1s) + kill grace (0s) + client slack
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.errored.get(&TaskErrorKind::Timeout), Some(&1));

    let result = harness.only_result().await;
    assert!(!result.success);
    assert_eq!(result.total_tokens, 0);
    let error = result.error.expect("timeout is recorded");
    assert_eq!(error.kind, TaskErrorKind::Timeout);
    assert_eq!(error.phase, "running_agent");
    assert!(!runtime.ran("diff --cached"), "no patch is captured after a timeout");
    assert_eq!(runtime.created(), 1);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_task_deadline_bounds_hanging_tests() {
    let harness = Harness::new();
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_patch(&file_diff("a.py", "A = 1"))
            .on("pytest", Reply::Hang),
    );
    let mut config = test_config(&harness.root);
    config.task_timeout_secs = 1;
    let instances = [instance("owner__repo-4", &["tests/t.py::test_x"], &[])];

    let started = Instant::now();
    harness
        .run(Arc::clone(&runtime), config, &instances)
        .await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = harness.only_result().await;
    let error = result.error.expect("timeout is recorded");
    assert_eq!(error.kind, TaskErrorKind::Timeout);
    assert_eq!(error.phase, "testing");
    // Work done before the deadline survives.
    assert_eq!(result.patch.applied_files_num, 1);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_container_released_after_failure_in_every_phase() {
    let cases: Vec<(&str, FakeRuntime, TaskErrorKind, &str)> = vec![
        (
            "start",
            FakeRuntime::new().failing_start(),
            TaskErrorKind::Provisioning,
            "provisioning",
        ),
        (
            "readiness",
            FakeRuntime::new().on("rev-parse HEAD", Reply::Fail),
            TaskErrorKind::Provisioning,
            "provisioning",
        ),
        (
            "agent",
            FakeRuntime::new().on("run-agent", Reply::Fail),
            TaskErrorKind::Infrastructure,
            "running_agent",
        ),
        (
            "patch",
            FakeRuntime::new()
                .with_patch(&file_diff("a.py", "A = 1"))
                .on("apply --verbose", Reply::Panic),
            TaskErrorKind::Internal,
            "applying_patch",
        ),
        (
            "test setup",
            FakeRuntime::new().on("featbench-test.patch", Reply::exit(1)),
            TaskErrorKind::Infrastructure,
            "testing",
        ),
        (
            "test run",
            FakeRuntime::new().on("pytest", Reply::Panic),
            TaskErrorKind::Internal,
            "testing",
        ),
    ];

    for (label, runtime, kind, phase) in cases {
        let harness = Harness::new();
        let runtime = Arc::new(runtime);
        let mut inst = instance("owner__repo-5", &["tests/t.py::test_x"], &[]);
        inst.test_patch = file_diff("tests/t.py", "def test_x(): pass");

        let summary = harness
            .run(Arc::clone(&runtime), test_config(&harness.root), &[inst])
            .await;
        assert_eq!(summary.total_errored(), 1, "{label}");

        let result = harness.only_result().await;
        let error = result.error.expect("failure is recorded");
        assert_eq!(error.kind, kind, "{label}: {}", error.message);
        assert_eq!(error.phase, phase, "{label}");
        assert!(!result.success, "{label}");
        assert_eq!(runtime.created(), 1, "{label}");
        assert_eq!(runtime.live(), 0, "{label}: container left behind");
        assert!(runtime.removed() >= 1, "{label}");
    }
}

#[tokio::test]
async fn test_rerun_over_complete_store_is_a_no_op() {
    let harness = Harness::new();
    let mut broken = instance("owner__repo-7", &["tests/t.py::test_x"], &[]);
    broken.test_cmd = Some("broken-runner".to_string());
    let instances = [instance("owner__repo-6", &["tests/t.py::test_x"], &[]), broken];

    let first = Arc::new(
        FakeRuntime::new()
            .with_patch(&file_diff("a.py", "A = 1"))
            .with_passing(&["tests/t.py::test_x"])
            .on("broken-runner", Reply::Fail),
    );
    let summary = harness
        .run(Arc::clone(&first), test_config(&harness.root), &instances)
        .await;
    assert_eq!(summary.scheduled, 2);
    assert_eq!(summary.resolved, 1);
    // Errored pairs count as recorded too.
    assert_eq!(summary.total_errored(), 1);
    assert_eq!(first.created(), 2);
    let before = std::fs::read(&harness.output).unwrap();

    let second = Arc::new(FakeRuntime::new());
    let summary = harness
        .run(Arc::clone(&second), test_config(&harness.root), &instances)
        .await;
    assert_eq!(summary.scheduled, 0);
    assert_eq!(summary.skipped, 2);
    assert_eq!(second.created(), 0);
    assert_eq!(std::fs::read(&harness.output).unwrap(), before);
}

#[tokio::test]
async fn test_every_pair_evaluated_once_per_agent() {
    let harness = Harness::new();
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_patch(&file_diff("a.py", "A = 1"))
            .with_passing(&["tests/t.py::test_x"]),
    );
    let mut config = test_config(&harness.root);
    let mut second = scripted_agent();
    second.name = "scripted-2".to_string();
    config.agents.push(second);
    let instances: Vec<Instance> = (0..3)
        .map(|i| instance(&format!("owner__repo-{i}"), &["tests/t.py::test_x"], &[]))
        .collect();

    let summary = harness.run(Arc::clone(&runtime), config, &instances).await;
    assert_eq!(summary.scheduled, 6);
    assert_eq!(summary.resolved, 6);
    assert_eq!(summary.per_agent.len(), 2);

    let keys: HashSet<_> = harness.results().await.iter().map(|r| r.key()).collect();
    assert_eq!(keys.len(), 6);
    assert_eq!(runtime.created(), 6);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_failed_agent_yields_empty_patch_and_no_tokens() {
    let harness = Harness::new();
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_patch(&file_diff("a.py", "A = 1"))
            .with_usage(900)
            .agent_exits_with(1),
    );
    let instances = [instance("owner__repo-8", &["tests/t.py::test_x"], &[])];

    let summary = harness
        .run(Arc::clone(&runtime), test_config(&harness.root), &instances)
        .await;
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.resolved, 0);

    let result = harness.only_result().await;
    assert_eq!(result.status, ResultStatus::Completed);
    assert!(result.error.is_none());
    assert_eq!(result.agent_exit_code, Some(1));
    assert_eq!(result.total_tokens, 0);
    assert_eq!(result.patch.patch_content, "");
    assert_eq!(result.patch.total_files_num, 0);
    assert_eq!(result.patch.applied_files_num, 0);
    assert!(!result.success_f2p && !result.success);
    assert!(!runtime.ran("diff --cached"), "a failed agent's tree is not diffed");
    assert!(runtime.ran("reset -q --hard"), "the checkout is still reset");
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_runner_without_report_is_an_empty_pass_set() {
    let harness = Harness::new();
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_patch(&file_diff("a.py", "A = 1"))
            .on("pytest", Reply::exit(2)),
    );
    let instances = [instance(
        "owner__repo-9",
        &["tests/t.py::test_x"],
        &["tests/t.py::test_keep"],
    )];

    harness
        .run(Arc::clone(&runtime), test_config(&harness.root), &instances)
        .await;

    let result = harness.only_result().await;
    assert_eq!(result.status, ResultStatus::Completed);
    assert!(result.error.is_none());
    assert!(result.passed_f2p_tests.is_empty());
    assert!(result.passed_p2p_tests.is_empty());
    assert!(!result.success_f2p && !result.success_p2p && !result.success);
    assert_eq!(result.patch.applied_files_num, 1);
}

#[tokio::test]
async fn test_escaping_file_is_skipped_and_others_apply() {
    let harness = Harness::new();
    let patch = format!(
        "{}{}{}",
        file_diff("a.py", "A = 1"),
        file_diff("../outside.py", "X = 1"),
        file_diff("c.py", "C = 1")
    );
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_patch(&patch)
            .with_passing(&["tests/t.py::test_x"]),
    );
    let instances = [instance("owner__repo-10", &["tests/t.py::test_x"], &[])];

    harness
        .run(Arc::clone(&runtime), test_config(&harness.root), &instances)
        .await;

    let result = harness.only_result().await;
    assert_eq!(result.patch.total_files_num, 3);
    assert_eq!(result.patch.applied_files_num, 2);
    assert_eq!(result.patch.applied_files, vec!["a.py", "c.py"]);
    assert!(!runtime.ran("featbench-1.diff"), "escaping file is never applied");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_transient_create_failures_are_retried() {
    let harness = Harness::new();
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_patch(&file_diff("a.py", "A = 1"))
            .with_passing(&["tests/t.py::test_x"])
            .flaky_create(2),
    );
    let mut config = test_config(&harness.root);
    config.provision_retries = 3;
    let instances = [instance("owner__repo-11", &["tests/t.py::test_x"], &[])];

    let summary = harness.run(Arc::clone(&runtime), config, &instances).await;
    assert_eq!(summary.resolved, 1);
    assert_eq!(runtime.create_attempts(), 3);
    assert_eq!(runtime.created(), 1);

    let result = harness.only_result().await;
    assert!(result.error.is_none());
    assert!(result.success);
    assert_eq!(runtime.live(), 0);
}

#[tokio::test]
async fn test_provisioning_gives_up_after_retries() {
    let harness = Harness::new();
    let runtime = Arc::new(FakeRuntime::new().flaky_create(usize::MAX));
    let mut config = test_config(&harness.root);
    config.provision_retries = 3;
    let instances = [instance("owner__repo-12", &["tests/t.py::test_x"], &[])];

    let summary = harness.run(Arc::clone(&runtime), config, &instances).await;
    assert_eq!(summary.errored.get(&TaskErrorKind::Provisioning), Some(&1));
    assert_eq!(runtime.create_attempts(), 3);
    assert_eq!(runtime.created(), 0);

    let result = harness.only_result().await;
    let error = result.error.expect("provisioning failure is recorded");
    assert_eq!(error.kind, TaskErrorKind::Provisioning);
    assert_eq!(error.phase, "provisioning");
    assert!(error.message.contains("connection refused"));
}

#[tokio::test]
async fn test_release_confirms_container_is_gone() {
    for sticky in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let fake = if sticky {
            FakeRuntime::new().sticky_removal()
        } else {
            FakeRuntime::new()
        };
        let runtime = Arc::new(fake);
        let mut config = test_config(dir.path());
        config.provision_retries = 2;
        let config = Arc::new(config);
        let controller = ContainerController::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&config),
            Arc::new(HarnessMetrics::new().unwrap()),
        );
        let inst = instance("owner__repo-13", &[], &[]);
        let agent = scripted_agent();
        let workspace = WorkspaceManager::new(&config)
            .unwrap()
            .create(&inst, &agent)
            .await
            .unwrap();

        let handle = controller.acquire(&inst, &agent, &workspace).await.unwrap();
        assert!(handle.image().starts_with("featbench_owner_repo:"));
        let id = handle.id().to_string();

        let confirmed = controller.release(handle).await;
        assert_eq!(confirmed, !sticky, "sticky={sticky}");
        assert_eq!(runtime.container_exists(&id).await.unwrap(), sticky);
        workspace.cleanup();
    }
}

#[tokio::test]
#[ignore] // Requires a running Docker daemon
async fn test_docker_daemon_reachable() {
    use featbench::execution::DockerClient;

    let client = DockerClient::new().expect("docker client");
    client.ping().await.expect("docker daemon should answer ping");
}
