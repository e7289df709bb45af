//! Durable result storage.
//!
//! Results are appended to a JSONL file keyed by `(agent, instance_id)`.
//! Re-running over the same file skips every pair already present.

pub mod results;

pub use results::{
    load_results, EvaluationResult, ResultKey, ResultStatus, ResultsStore, TaskError,
    TaskErrorKind,
};
