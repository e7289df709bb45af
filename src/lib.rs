//! featbench: evaluation harness for coding agents on feature-implementation
//! tasks.
//!
//! Each (instance, agent) pair runs in its own container: the agent edits
//! the checkout, its diff is applied file by file to a clean tree, the
//! Fail-to-Pass and Pass-to-Pass tests run, and one classified result is
//! appended to a resumable JSONL store.

// Core modules
pub mod cli;
pub mod config;
pub mod corpus;
pub mod error;
pub mod evaluation;
pub mod execution;
pub mod metrics;
pub mod patch;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod testing;
pub mod utils;
pub mod workspace;

// Re-export commonly used types
pub use config::{AgentDescriptor, HarnessConfig};
pub use corpus::Instance;
pub use error::{ConfigError, CorpusError, DockerError, StoreError};
pub use scheduler::{EvaluationScheduler, RunSummary};
pub use storage::{EvaluationResult, ResultsStore};
