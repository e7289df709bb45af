//! Test Executor.
//!
//! Runs the Fail-to-Pass and Pass-to-Pass selections against the patched
//! checkout and reports which declared tests explicitly passed.

pub mod executor;
pub mod parser;

use std::collections::BTreeSet;

pub use executor::{TestError, TestExecutor};
pub use parser::{parse_pytest_output, TestReport, TestStatus};

/// Passed tests per selection, each a subset of the declared ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOutcomeSet {
    pub passed_f2p: BTreeSet<String>,
    pub passed_p2p: BTreeSet<String>,
}
