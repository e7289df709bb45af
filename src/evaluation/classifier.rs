//! Result Classifier.
//!
//! Two independent criteria: every Fail-to-Pass test must now pass (the
//! feature works) and every Pass-to-Pass test must still pass (nothing
//! regressed). An empty declared set is satisfied vacuously.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Classification of one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub success_f2p: bool,
    pub success_p2p: bool,
    pub success: bool,
}

/// Pure classification over declared and passed test ids.
pub fn classify<S: AsRef<str>>(
    declared_f2p: &[S],
    declared_p2p: &[S],
    passed_f2p: &BTreeSet<String>,
    passed_p2p: &BTreeSet<String>,
) -> Verdict {
    let success_f2p = all_passed(declared_f2p, passed_f2p);
    let success_p2p = all_passed(declared_p2p, passed_p2p);
    Verdict {
        success_f2p,
        success_p2p,
        success: success_f2p && success_p2p,
    }
}

fn all_passed<S: AsRef<str>>(declared: &[S], passed: &BTreeSet<String>) -> bool {
    declared.iter().all(|id| passed.contains(id.as_ref()))
}
