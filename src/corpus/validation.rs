//! Input validation for values that end up in container commands or paths.
//!
//! Every value is shell-quoted before use, so these checks are about meaning
//! rather than quoting: refs must look like refs, repository names like
//! `owner/repo`, and file paths must stay inside the checkout.

use std::path::{Component, Path};

use thiserror::Error;

/// A rejected input value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("{what} is empty")]
    Empty { what: &'static str },

    #[error("{what} too long ({len} chars, max {max})")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("invalid character {ch:?} in {what} '{value}'")]
    InvalidChar {
        what: &'static str,
        ch: char,
        value: String,
    },

    #[error("{what} '{value}' must not start with '-' or '.'")]
    LeadingDashOrDot { what: &'static str, value: String },

    #[error("{what} '{value}' escapes the repository root")]
    OutsideRoot { what: &'static str, value: String },

    #[error("invalid repository name '{0}': expected 'owner/repo'")]
    RepoFormat(String),
}

fn check_length(what: &'static str, value: &str, max: usize) -> Result<(), InputError> {
    if value.is_empty() {
        return Err(InputError::Empty { what });
    }
    if value.len() > max {
        return Err(InputError::TooLong {
            what,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

/// Validates a commit-ish (SHA, tag or branch name).
pub fn validate_git_ref(value: &str) -> Result<(), InputError> {
    const WHAT: &str = "git ref";
    check_length(WHAT, value, 256)?;
    if value.starts_with('-') {
        return Err(InputError::LeadingDashOrDot {
            what: WHAT,
            value: value.to_string(),
        });
    }
    if value.contains("..") {
        return Err(InputError::OutsideRoot {
            what: WHAT,
            value: value.to_string(),
        });
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_' | '~' | '^'))
    {
        return Err(InputError::InvalidChar {
            what: WHAT,
            ch,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Validates a GitHub `owner/repo` name.
pub fn validate_repo_name(value: &str) -> Result<(), InputError> {
    const WHAT: &str = "repository name";
    check_length(WHAT, value, 256)?;

    let Some((owner, repo)) = value.split_once('/') else {
        return Err(InputError::RepoFormat(value.to_string()));
    };
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return Err(InputError::RepoFormat(value.to_string()));
    }
    for part in [owner, repo] {
        if part.starts_with('.') || part.starts_with('-') {
            return Err(InputError::LeadingDashOrDot {
                what: WHAT,
                value: value.to_string(),
            });
        }
        if let Some(ch) = part
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        {
            return Err(InputError::InvalidChar {
                what: WHAT,
                ch,
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Validates a path relative to the repository root.
///
/// Absolute paths, `..` components, NUL bytes and line breaks are rejected.
pub fn validate_relative_path(value: &str) -> Result<(), InputError> {
    const WHAT: &str = "file path";
    check_length(WHAT, value, 4096)?;

    if let Some(ch) = value.chars().find(|c| matches!(c, '\0' | '\n' | '\r')) {
        return Err(InputError::InvalidChar {
            what: WHAT,
            ch,
            value: value.escape_default().to_string(),
        });
    }
    let outside = Path::new(value).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if outside {
        return Err(InputError::OutsideRoot {
            what: WHAT,
            value: value.to_string(),
        });
    }
    Ok(())
}
