//! Shell quoting and command rendering for commands run inside containers.
//!
//! Everything executed in a container goes through `bash -lc <script>`, so
//! every value interpolated into a script is single-quoted here.

/// Quotes a value for POSIX shells.
///
/// Plain words made of safe characters are returned unchanged; anything else
/// is wrapped in single quotes with embedded quotes written as `'\''`.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '+' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Joins values into a space-separated list of quoted shell words.
pub fn quote_all<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(|v| quote(v.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds a git invocation against the checkout at `repo_dir`.
///
/// `safe.directory` is set on the command line because the checkout inside
/// the image is usually owned by a different uid than the exec user.
pub fn git(repo_dir: &str, args: &str) -> String {
    format!("git -c safe.directory='*' -C {} {}", quote(repo_dir), args)
}

/// Substitutes `{name}` placeholders with shell-quoted values.
///
/// Unknown placeholders are left untouched.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (name, value) in vars {
        rendered = rendered.replace(&format!("{{{name}}}"), &quote(value));
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_words() {
        assert_eq!(quote("tests/test_a.py::test_b"), "tests/test_a.py::test_b");
        assert_eq!(quote("/workdir/repo"), "/workdir/repo");
    }

    #[test]
    fn test_quote_special_characters() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("test_x[1-2]"), "'test_x[1-2]'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_quote_all() {
        let ids = vec!["a.py::t1".to_string(), "a.py::t[x y]".to_string()];
        assert_eq!(quote_all(&ids), "a.py::t1 'a.py::t[x y]'");
    }

    #[test]
    fn test_git_command() {
        assert_eq!(
            git("/workdir/repo", "rev-parse HEAD"),
            "git -c safe.directory='*' -C /workdir/repo rev-parse HEAD"
        );
    }

    #[test]
    fn test_render_quotes_values() {
        let cmd = render(
            "agent --task {problem_file} --model {model} {unknown}",
            &[("problem_file", "/workdir/swap/problem.txt"), ("model", "gpt 4")],
        );
        assert_eq!(
            cmd,
            "agent --task /workdir/swap/problem.txt --model 'gpt 4' {unknown}"
        );
    }
}
