//! Evaluation scheduling.
//!
//! The queue is every (instance, agent) pair not already in the results
//! store. A fixed pool of workers takes one pair at a time through:
//!
//! ```text
//!   ┌─────────┐   ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//!   │ Pending │──▶│ Provisioning │──▶│ RunningAgent │──▶│ ApplyingPatch │
//!   └─────────┘   └──────────────┘   └──────────────┘   └───────┬───────┘
//!                                                               ▼
//!                 ┌──────────┐   ┌────────────┐   ┌─────────┐
//!                 │ Recorded │◀──│ Classified │◀──│ Testing │
//!                 └──────────┘   └────────────┘   └─────────┘
//! ```
//!
//! Any non-terminal state may move to `Errored`. The container is released
//! before the result is written, whatever the outcome.

pub mod job;
pub mod pipeline;
pub mod worker_pool;

pub use job::{EvaluationTask, InvalidTransition, TaskProgress, TaskState};
pub use pipeline::{run_phases, PhaseContext, TaskFailure};
pub use worker_pool::{
    plan_tasks, AgentSummary, EvaluationScheduler, PoolError, RunSummary, ShutdownHandle,
    TaskOutcome,
};
