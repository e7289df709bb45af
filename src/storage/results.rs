//! Append-only JSONL results store.
//!
//! One line per (agent, instance_id). A line is written with a single
//! `write_all` and flushed before the pair counts as recorded, so a crash
//! leaves at most one truncated trailing line. That line is skipped on the
//! next open and its pair is evaluated again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::patch::PatchApplicationRecord;

/// Identity of one evaluation in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultKey {
    pub agent: String,
    pub instance_id: String,
}

impl ResultKey {
    pub fn new(agent: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl std::fmt::Display for ResultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.agent, self.instance_id)
    }
}

/// Final state of a recorded evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The pipeline ran to classification.
    Completed,
    /// The task was aborted; see `error`.
    Errored,
}

/// Why a task was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Image, container start or readiness failed after retries.
    Provisioning,
    /// A phase or the whole task exceeded its wall-clock limit.
    Timeout,
    /// Container died, agent install failed, test setup failed.
    Infrastructure,
    /// Harness bug, including a panic inside a phase.
    Internal,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskErrorKind::Provisioning => "provisioning",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::Infrastructure => "infrastructure",
            TaskErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Error attached to an errored result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    /// Pipeline state the task was in when it failed.
    pub phase: String,
    pub message: String,
}

/// One line of the results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub agent: String,
    pub model: String,
    pub instance_id: String,
    pub status: ResultStatus,
    pub success_f2p: bool,
    pub success_p2p: bool,
    pub success: bool,
    pub passed_f2p_tests: Vec<String>,
    pub passed_p2p_tests: Vec<String>,
    pub total_tokens: u64,
    #[serde(flatten)]
    pub patch: PatchApplicationRecord,
    /// The instance declares no Fail-to-Pass tests, so `success_f2p` is vacuous.
    #[serde(default)]
    pub empty_f2p: bool,
    #[serde(default)]
    pub agent_exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub duration_secs: f64,
    pub finished_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn key(&self) -> ResultKey {
        ResultKey::new(&self.agent, &self.instance_id)
    }

    pub fn error_kind(&self) -> Option<TaskErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

struct StoreState {
    file: File,
    keys: HashSet<ResultKey>,
    /// File length after the last complete line.
    len: u64,
}

impl StoreState {
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        let written = async {
            self.file.write_all(line).await?;
            self.file.flush().await?;
            self.file.sync_data().await
        }
        .await;
        match written {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.discard_partial().await;
                Err(e)
            }
        }
    }

    /// Cuts the file back to its last complete line so a failed write
    /// cannot merge with the next record.
    async fn discard_partial(&mut self) {
        let Err(e) = self.file.set_len(self.len).await else {
            return;
        };
        warn!(error = %e, "Failed to truncate partial result line, terminating it instead");
        if self.file.write_all(b"\n").await.is_ok() {
            let _ = self.file.flush().await;
        }
        if let Ok(meta) = self.file.metadata().await {
            self.len = meta.len();
        }
    }
}

/// Durable, resumable sink for evaluation results.
pub struct ResultsStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl ResultsStore {
    /// Opens (or creates) the store and indexes the keys already recorded.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| StoreError::Open {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(open_err)?;
        }

        let existing = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(open_err(e)),
        };
        let keys = index_keys(&existing, &path);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(open_err)?;

        let mut len = existing.len() as u64;
        // Terminate a truncated last line so the next record starts clean.
        if !existing.is_empty() && !existing.ends_with('\n') {
            file.write_all(b"\n").await.map_err(open_err)?;
            file.flush().await.map_err(open_err)?;
            len += 1;
        }

        info!(path = %path.display(), recorded = keys.len(), "Opened results store");
        Ok(Self {
            path,
            state: Mutex::new(StoreState { file, keys, len }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one result as a single line and flushes it to disk.
    pub async fn append(&self, result: &EvaluationResult) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let mut state = self.state.lock().await;
        state.write_line(line.as_bytes()).await?;
        state.keys.insert(result.key());

        debug!(key = %result.key(), "Result recorded");
        Ok(())
    }

    pub async fn contains(&self, key: &ResultKey) -> bool {
        self.state.lock().await.keys.contains(key)
    }

    /// Every key recorded so far, including this run's.
    pub async fn recorded_keys(&self) -> HashSet<ResultKey> {
        self.state.lock().await.keys.clone()
    }
}

fn index_keys(content: &str, path: &Path) -> HashSet<ResultKey> {
    let mut keys = HashSet::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ResultKey>(line) {
            Ok(key) => {
                keys.insert(key);
            }
            Err(e) => warn!(
                path = %path.display(),
                line = idx + 1,
                error = %e,
                "Skipping unreadable result line"
            ),
        }
    }
    keys
}

/// Reads every well-formed result in `path`.
pub async fn load_results(path: impl AsRef<Path>) -> Result<Vec<EvaluationResult>, StoreError> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Open {
                path: path.display().to_string(),
                source,
            })
        }
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(agent: &str, instance_id: &str) -> EvaluationResult {
        EvaluationResult {
            agent: agent.to_string(),
            model: "gpt-4o".to_string(),
            instance_id: instance_id.to_string(),
            status: ResultStatus::Completed,
            success_f2p: true,
            success_p2p: true,
            success: true,
            passed_f2p_tests: vec!["t.py::test_new".to_string()],
            passed_p2p_tests: vec![],
            total_tokens: 1234,
            patch: PatchApplicationRecord {
                total_files_num: 1,
                applied_files_num: 1,
                applied_files: vec!["a.py".to_string()],
                patch_content: "diff --git a/a.py b/a.py\n".to_string(),
            },
            empty_f2p: false,
            agent_exit_code: Some(0),
            error: None,
            duration_secs: 12.5,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/results.jsonl");

        let store = ResultsStore::open(&path).await.unwrap();
        store.append(&sample("trae-agent", "a-1")).await.unwrap();
        store.append(&sample("trae-agent", "a-2")).await.unwrap();
        assert!(store.contains(&ResultKey::new("trae-agent", "a-1")).await);
        drop(store);

        let reopened = ResultsStore::open(&path).await.unwrap();
        let keys = reopened.recorded_keys().await;
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&ResultKey::new("trae-agent", "a-2")));
        assert!(!keys.contains(&ResultKey::new("other", "a-2")));

        let results = load_results(&path).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].total_tokens, 1234);
    }

    #[tokio::test]
    async fn test_truncated_line_is_skipped_and_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let good = serde_json::to_string(&sample("agent", "a-1")).unwrap();
        std::fs::write(&path, format!("{good}\n{{\"agent\":\"agent\",\"insta")).unwrap();

        let store = ResultsStore::open(&path).await.unwrap();
        assert_eq!(store.recorded_keys().await.len(), 1);
        store.append(&sample("agent", "a-2")).await.unwrap();
        drop(store);

        let results = load_results(&path).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a-1", "a-2"]);
    }

    #[tokio::test]
    async fn test_partial_write_does_not_swallow_next_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");

        let store = ResultsStore::open(&path).await.unwrap();
        store.append(&sample("agent", "a-1")).await.unwrap();
        {
            // A write that died halfway through its line.
            let mut state = store.state.lock().await;
            state.file.write_all(b"{\"agent\":\"agent\",\"insta").await.unwrap();
            state.file.flush().await.unwrap();
            state.discard_partial().await;
        }
        store.append(&sample("agent", "a-2")).await.unwrap();
        drop(store);

        let results = load_results(&path).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a-1", "a-2"]);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_result_serialization_shape() {
        let mut result = sample("agent", "a-1");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["applied_files_num"], 1);
        assert!(value.get("patch").is_none());
        assert!(value.get("error").is_none());

        result.status = ResultStatus::Errored;
        result.error = Some(TaskError {
            kind: TaskErrorKind::Timeout,
            phase: "running_agent".to_string(),
            message: "agent exceeded 1800s".to_string(),
        });
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["error"]["kind"], "timeout");
        let back: EvaluationResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.error_kind(), Some(TaskErrorKind::Timeout));
    }
}
