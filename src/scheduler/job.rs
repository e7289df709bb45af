//! Evaluation tasks and their state machine.
//!
//! ```text
//! Pending → Provisioning → RunningAgent → ApplyingPatch → Testing → Classified → Recorded
//!    └──────────┴──────────────┴───────────────┴─────────────┴──────────┴──→ Errored
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AgentDescriptor;
use crate::corpus::Instance;
use crate::patch::PatchApplicationRecord;
use crate::storage::ResultKey;

/// One (instance, agent) evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationTask {
    pub id: Uuid,
    pub instance: Arc<Instance>,
    pub agent: Arc<AgentDescriptor>,
    pub created_at: DateTime<Utc>,
}

impl EvaluationTask {
    pub fn new(instance: Arc<Instance>, agent: Arc<AgentDescriptor>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance,
            agent,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ResultKey {
        ResultKey::new(&self.agent.name, &self.instance.instance_id)
    }
}

/// Lifecycle state of an evaluation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Provisioning,
    RunningAgent,
    ApplyingPatch,
    Testing,
    Classified,
    Recorded,
    Errored,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Provisioning => "provisioning",
            TaskState::RunningAgent => "running_agent",
            TaskState::ApplyingPatch => "applying_patch",
            TaskState::Testing => "testing",
            TaskState::Classified => "classified",
            TaskState::Recorded => "recorded",
            TaskState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Recorded | TaskState::Errored)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (from, Errored) => !from.is_terminal(),
            (Pending, Provisioning)
            | (Provisioning, RunningAgent)
            | (RunningAgent, ApplyingPatch)
            | (ApplyingPatch, Testing)
            | (Testing, Classified)
            | (Classified, Recorded) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid task transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskState,
    pub to: TaskState,
}

/// What a task has produced so far.
///
/// Survives the cancellation of the phase that was filling it, so a timed
/// out or panicked task still reports its tokens and patch record.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    state: TaskState,
    history: Vec<TaskState>,
    pub total_tokens: u64,
    pub agent_exit_code: Option<i64>,
    pub patch: Option<PatchApplicationRecord>,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self {
            state: TaskState::Pending,
            history: vec![TaskState::Pending],
            total_tokens: 0,
            agent_exit_code: None,
            patch: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn history(&self) -> &[TaskState] {
        &self.history
    }

    pub fn advance(&mut self, next: TaskState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self::new()
    }
}
