//! Splitting unified diffs into per-file pieces.
//!
//! Git-style patches (`diff --git` headers) are split on those headers.
//! Plain unified diffs without them are split on `---`/`+++` header pairs.
//! Text before the first header is dropped.

use serde::{Deserialize, Serialize};

/// One file's portion of a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Path the diff applies to, relative to the repository root.
    pub path: String,
    /// Source path when it differs from `path` (renames, deletions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    /// Lines added.
    pub additions: usize,
    /// Lines removed.
    pub deletions: usize,
    /// The raw diff text for this file, newline-terminated.
    #[serde(skip)]
    pub content: String,
}

impl FileDiff {
    /// Lines touched (additions plus deletions).
    pub fn changes(&self) -> usize {
        self.additions + self.deletions
    }

    /// Every path this diff reads or writes.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.path.as_str()).chain(self.old_path.as_deref())
    }
}

/// Splits `patch` into per-file diffs in the order they appear.
pub fn split_patch(patch: &str) -> Vec<FileDiff> {
    let lines: Vec<&str> = patch.split_inclusive('\n').collect();
    let git_style = lines.iter().any(|l| l.starts_with("diff --git "));

    let mut starts = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let is_start = if git_style {
            line.starts_with("diff --git ")
        } else {
            line.starts_with("--- ")
                && lines
                    .get(idx + 1)
                    .is_some_and(|next| next.starts_with("+++ "))
        };
        if is_start {
            starts.push(idx);
        }
    }

    starts
        .iter()
        .enumerate()
        .filter_map(|(n, &start)| {
            let end = starts.get(n + 1).copied().unwrap_or(lines.len());
            parse_file_diff(&lines[start..end])
        })
        .collect()
}

fn parse_file_diff(lines: &[&str]) -> Option<FileDiff> {
    let mut header_path = None;
    let mut minus_path = None;
    let mut plus_path = None;
    let mut rename_from = None;
    let mut rename_to = None;
    let mut additions = 0;
    let mut deletions = 0;
    let mut in_hunk = false;

    for raw in lines {
        let line = raw.trim_end_matches(['\n', '\r']);
        if in_hunk {
            if line.starts_with("@@") {
                continue;
            }
            if line.starts_with('+') {
                additions += 1;
                continue;
            }
            if line.starts_with('-') {
                deletions += 1;
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\\') || line.is_empty() {
                continue;
            }
            in_hunk = false;
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            header_path = parse_git_header(rest);
        } else if let Some(rest) = line.strip_prefix("--- ") {
            minus_path = strip_side(rest, "a/");
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            plus_path = strip_side(rest, "b/");
        } else if let Some(rest) = line.strip_prefix("rename from ") {
            rename_from = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("rename to ") {
            rename_to = Some(rest.to_string());
        } else if line.starts_with("@@") {
            in_hunk = true;
        }
    }

    let path = plus_path
        .clone()
        .or_else(|| rename_to.clone())
        .or_else(|| minus_path.clone())
        .or_else(|| header_path.clone())?;
    let old_path = rename_from
        .or(minus_path)
        .or(header_path)
        .filter(|old| *old != path);

    let mut content: String = lines.concat();
    if !content.ends_with('\n') {
        content.push('\n');
    }

    Some(FileDiff {
        path,
        old_path,
        additions,
        deletions,
        content,
    })
}

/// Takes the `b/` side of `a/<old> b/<new>`.
fn parse_git_header(rest: &str) -> Option<String> {
    let rest = rest.trim();
    if let Some(idx) = rest.rfind(" b/") {
        return Some(rest[idx + 3..].to_string());
    }
    if let Some(idx) = rest.rfind(" \"b/") {
        return Some(rest[idx + 4..].trim_end_matches('"').to_string());
    }
    None
}

/// Strips the side prefix from a `---`/`+++` path; `/dev/null` yields `None`.
fn strip_side(rest: &str, prefix: &str) -> Option<String> {
    // Plain diffs may carry a tab-separated timestamp.
    let raw = rest.split('\t').next().unwrap_or(rest).trim();
    let raw = raw.trim_matches('"');
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix(prefix).unwrap_or(raw).to_string())
}
