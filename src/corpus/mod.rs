//! The benchmark instance corpus.
//!
//! Instances are produced by the upstream curation pipeline and are
//! read-only here. The corpus file is either a JSON array of instances or
//! JSONL with one instance per line.

pub mod loader;
pub mod validation;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::patch::diff::{split_patch, FileDiff};

pub use loader::load_corpus;
pub use validation::{validate_git_ref, validate_relative_path, validate_repo_name, InputError};

/// One benchmark task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier, e.g. `owner__repo-1234`.
    pub instance_id: String,
    /// Repository in `owner/repo` form.
    pub repo: String,
    /// Commit the task starts from.
    pub base_commit: String,
    /// Natural-language feature request; the only input agents receive.
    pub problem_statement: String,
    /// Reference implementation diff.
    #[serde(default)]
    pub patch: String,
    /// Diff adding or updating the evaluation tests.
    #[serde(default)]
    pub test_patch: String,
    /// Test files restored to the base commit before `test_patch` is applied.
    #[serde(default, deserialize_with = "string_list")]
    pub test_files: Vec<String>,
    /// Tests expected to fail before and pass after the feature lands.
    #[serde(rename = "FAIL_TO_PASS", default, deserialize_with = "string_list")]
    pub fail_to_pass: Vec<String>,
    /// Regression tests expected to pass before and after.
    #[serde(rename = "PASS_TO_PASS", default, deserialize_with = "string_list")]
    pub pass_to_pass: Vec<String>,
    /// Prebuilt image name; derived from repo and number when absent.
    #[serde(default)]
    pub docker_image: Option<String>,
    /// Pull request or release number used in the default image tag.
    #[serde(default)]
    pub number: Option<u64>,
    /// Test command override for this instance.
    #[serde(default)]
    pub test_cmd: Option<String>,
}

impl Instance {
    /// Creates an instance with only identity fields set.
    pub fn new(
        instance_id: impl Into<String>,
        repo: impl Into<String>,
        base_commit: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            repo: repo.into(),
            base_commit: base_commit.into(),
            problem_statement: String::new(),
            patch: String::new(),
            test_patch: String::new(),
            test_files: Vec::new(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
            docker_image: None,
            number: None,
            test_cmd: None,
        }
    }

    /// The reference patch split into per-file diffs.
    pub fn reference_files(&self) -> Vec<FileDiff> {
        split_patch(&self.patch)
    }

    /// Whether success on new behavior is vacuous for this instance.
    pub fn has_empty_fail_to_pass(&self) -> bool {
        self.fail_to_pass.is_empty()
    }

    /// Checks every field that is later used in container commands.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.instance_id.trim().is_empty() {
            return Err(InputError::Empty { what: "instance_id" });
        }
        validate_repo_name(&self.repo)?;
        validate_git_ref(&self.base_commit)?;
        for file in &self.test_files {
            validate_relative_path(file)?;
        }
        Ok(())
    }
}

/// Accepts a list of strings, a JSON-encoded list inside a string, or null.
///
/// Upstream datasets store test id lists both ways.
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(s) => Ok(s),
                other => Err(D::Error::custom(format!(
                    "expected a string test id, got {other}"
                ))),
            })
            .collect(),
        Some(serde_json::Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(Vec::new());
            }
            serde_json::from_str::<Vec<String>>(trimmed).map_err(D::Error::custom)
        }
        Some(other) => Err(D::Error::custom(format!(
            "expected a list of test ids, got {other}"
        ))),
    }
}
