//! pytest report parsing.
//!
//! Understands both the `-rA` short summary (`PASSED tests/a.py::t`) and
//! verbose per-test lines (`tests/a.py::t PASSED [ 50%]`). Colour codes are
//! stripped first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Status of one test as reported by pytest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Skipped,
    XFail,
    XPass,
    Failed,
    Error,
}

impl TestStatus {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "PASSED" => Some(TestStatus::Passed),
            "FAILED" => Some(TestStatus::Failed),
            "ERROR" => Some(TestStatus::Error),
            "SKIPPED" => Some(TestStatus::Skipped),
            "XFAIL" => Some(TestStatus::XFail),
            "XPASS" => Some(TestStatus::XPass),
            _ => None,
        }
    }

    /// Failures win over a pass reported for the same id (setup or
    /// teardown errors print after the call phase passed).
    fn severity(self) -> u8 {
        match self {
            TestStatus::Passed => 0,
            TestStatus::Skipped | TestStatus::XFail | TestStatus::XPass => 1,
            TestStatus::Failed => 2,
            TestStatus::Error => 3,
        }
    }
}

/// Parsed statuses keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestReport {
    statuses: BTreeMap<String, TestStatus>,
}

impl TestReport {
    pub fn status(&self, id: &str) -> Option<TestStatus> {
        self.statuses.get(id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Every id whose final status is `PASSED`.
    pub fn passed(&self) -> BTreeSet<String> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == TestStatus::Passed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The declared ids that passed. Matching is exact.
    pub fn passed_among<S: AsRef<str>>(&self, declared: &[S]) -> BTreeSet<String> {
        declared
            .iter()
            .map(AsRef::as_ref)
            .filter(|id| self.status(id) == Some(TestStatus::Passed))
            .map(str::to_string)
            .collect()
    }

    fn record(&mut self, id: &str, status: TestStatus) {
        let id = id.trim();
        if id.is_empty() {
            return;
        }
        self.statuses
            .entry(id.to_string())
            .and_modify(|existing| {
                if status.severity() > existing.severity() {
                    *existing = status;
                }
            })
            .or_insert(status);
    }
}

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid regex"))
}

fn summary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)\s+(.+)$").expect("valid regex")
    })
}

fn verbose_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\S.*::.*?)\s+(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)(\s+\[\s*\d+%\])?\s*$")
            .expect("valid regex")
    })
}

/// Parses pytest output into per-test statuses.
pub fn parse_pytest_output(output: &str) -> TestReport {
    let clean = ansi_regex().replace_all(output, "");
    let mut report = TestReport::default();

    for raw in clean.lines() {
        let line = raw.trim_end();
        if let Some(caps) = summary_regex().captures(line) {
            let Some(status) = TestStatus::parse(&caps[1]) else {
                continue;
            };
            let rest = caps[2].trim();
            let id = match status {
                TestStatus::Passed => rest,
                // `FAILED id - message`; ids with spaces still end before " - ".
                _ => rest.split(" - ").next().unwrap_or(rest),
            };
            // `SKIPPED [1] path:line: reason` carries no node id.
            if id.starts_with('[') {
                continue;
            }
            report.record(id, status);
        } else if let Some(caps) = verbose_regex().captures(line) {
            if let Some(status) = TestStatus::parse(&caps[2]) {
                report.record(&caps[1], status);
            }
        }
    }
    report
}
