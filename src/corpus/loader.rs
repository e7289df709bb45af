//! Loading the instance corpus from disk.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use crate::corpus::Instance;
use crate::error::CorpusError;

/// Loads and validates every instance in `path`.
///
/// Accepts a JSON array or JSONL. Duplicate `instance_id`s keep the first
/// occurrence. Any unparsable record or invalid instance fails the whole
/// load: a corpus problem is a run-level misconfiguration.
pub fn load_corpus(path: &Path) -> Result<Vec<Instance>, CorpusError> {
    let shown = path.display().to_string();
    if !path.exists() {
        return Err(CorpusError::NotFound { path: shown });
    }
    let content = std::fs::read_to_string(path)?;
    let parsed = parse_corpus(&content, &shown)?;

    let mut seen = HashSet::new();
    let mut instances = Vec::with_capacity(parsed.len());
    for instance in parsed {
        instance
            .validate()
            .map_err(|e| CorpusError::InvalidInstance {
                instance_id: instance.instance_id.clone(),
                reason: e.to_string(),
            })?;
        if !seen.insert(instance.instance_id.clone()) {
            warn!(instance_id = %instance.instance_id, "Duplicate instance in corpus, keeping first");
            continue;
        }
        instances.push(instance);
    }

    if instances.is_empty() {
        return Err(CorpusError::Empty(shown));
    }
    info!(path = %shown, instances = instances.len(), "Loaded corpus");
    Ok(instances)
}

fn parse_corpus(content: &str, path: &str) -> Result<Vec<Instance>, CorpusError> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| CorpusError::Parse {
            path: path.to_string(),
            index: e.line(),
            message: e.to_string(),
        });
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| CorpusError::Parse {
                path: path.to_string(),
                index: idx + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Keeps only the instances named in `ids`, in corpus order.
///
/// An empty selection keeps everything. Unknown ids are reported back.
pub fn select_instances(instances: Vec<Instance>, ids: &[String]) -> (Vec<Instance>, Vec<String>) {
    if ids.is_empty() {
        return (instances, Vec::new());
    }
    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let present: HashSet<String> = instances.iter().map(|i| i.instance_id.clone()).collect();
    let unknown = ids
        .iter()
        .filter(|id| !present.contains(id.as_str()))
        .cloned()
        .collect();
    let selected = instances
        .into_iter()
        .filter(|i| wanted.contains(i.instance_id.as_str()))
        .collect();
    (selected, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(id: &str) -> String {
        serde_json::json!({
            "instance_id": id,
            "repo": "owner/repo",
            "base_commit": "abc1234",
            "problem_statement": "Implement the thing",
            "FAIL_TO_PASS": ["t.py::test_new"],
            "PASS_TO_PASS": []
        })
        .to_string()
    }

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_json_array() {
        let file = write_file(&format!("[{}, {}]", record("a-1"), record("a-2")));
        let instances = load_corpus(file.path()).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].instance_id, "a-2");
    }

    #[test]
    fn test_load_jsonl_with_duplicates_and_blank_lines() {
        let file = write_file(&format!("{}\n\n{}\n{}\n", record("a-1"), record("a-2"), record("a-1")));
        let instances = load_corpus(file.path()).unwrap();
        let ids: Vec<_> = instances.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a-1", "a-2"]);
    }

    #[test]
    fn test_bad_line_reports_position() {
        let file = write_file(&format!("{}\nnot json\n", record("a-1")));
        let err = load_corpus(file.path()).unwrap_err();
        assert!(matches!(err, CorpusError::Parse { index: 2, .. }));
    }

    #[test]
    fn test_invalid_instance_is_fatal() {
        let bad = record("a-1").replace("abc1234", "abc; rm -rf /");
        let file = write_file(&bad);
        let err = load_corpus(file.path()).unwrap_err();
        assert!(err.to_string().contains("a-1"));
    }

    #[test]
    fn test_missing_and_empty() {
        assert!(matches!(
            load_corpus(Path::new("/nonexistent/corpus.json")),
            Err(CorpusError::NotFound { .. })
        ));
        let file = write_file("[]");
        assert!(matches!(load_corpus(file.path()), Err(CorpusError::Empty(_))));
    }

    #[test]
    fn test_select_instances() {
        let file = write_file(&format!("[{}, {}, {}]", record("a-1"), record("a-2"), record("a-3")));
        let instances = load_corpus(file.path()).unwrap();

        let (all, unknown) = select_instances(instances.clone(), &[]);
        assert_eq!(all.len(), 3);
        assert!(unknown.is_empty());

        let (some, unknown) =
            select_instances(instances, &["a-3".to_string(), "a-1".to_string(), "zz".to_string()]);
        let ids: Vec<_> = some.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a-1", "a-3"]);
        assert_eq!(unknown, vec!["zz".to_string()]);
    }
}
