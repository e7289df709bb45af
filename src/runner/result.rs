//! What an agent run leaves behind: token usage and the captured patch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage reported by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input/prompt tokens.
    pub input_tokens: u64,
    /// Output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Sums `llm_interactions[].response.usage` in a trae trajectory.
    ///
    /// Missing or malformed entries contribute nothing.
    pub fn from_trajectory(trajectory: &Value) -> Self {
        let Some(interactions) = trajectory.get("llm_interactions").and_then(Value::as_array)
        else {
            return Self::default();
        };
        interactions
            .iter()
            .filter_map(|i| i.pointer("/response/usage"))
            .fold(Self::default(), |acc, usage| {
                Self::new(
                    acc.input_tokens + field_u64(usage, "input_tokens"),
                    acc.output_tokens + field_u64(usage, "output_tokens"),
                )
            })
    }

    /// Reads a `usage.json` report: either `total_tokens` alone, or
    /// input/output counts (`input_tokens`/`output_tokens` or
    /// `prompt_tokens`/`completion_tokens`).
    pub fn from_usage_report(report: &Value) -> Self {
        let input = field_u64(report, "input_tokens").max(field_u64(report, "prompt_tokens"));
        let output =
            field_u64(report, "output_tokens").max(field_u64(report, "completion_tokens"));
        if input == 0 && output == 0 {
            return Self::new(field_u64(report, "total_tokens"), 0);
        }
        Self::new(input, output)
    }
}

fn field_u64(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Outcome of one agent invocation inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRun {
    /// Exit code of the agent process; `None` when it was killed on timeout.
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    /// Usage read back after the run; zero when unavailable.
    pub usage: TokenUsage,
}

/// Everything the runner hands to patch application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutcome {
    pub run: AgentRun,
    /// Working-tree diff against the base commit; empty on no change, timeout
    /// or nonzero exit.
    pub patch: String,
}

impl AgentOutcome {
    pub fn total_tokens(&self) -> u64 {
        self.run.usage.total()
    }

    pub fn timed_out(&self) -> bool {
        self.run.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trajectory_usage() {
        let trajectory = json!({
            "task": "Add a flag",
            "llm_interactions": [
                {"response": {"usage": {"input_tokens": 1200, "output_tokens": 300}}},
                {"response": {"usage": {"input_tokens": 800, "output_tokens": 50, "cache_read_input_tokens": 10}}},
                {"response": {"content": "no usage here"}},
            ]
        });
        let usage = TokenUsage::from_trajectory(&trajectory);
        assert_eq!(usage, TokenUsage::new(2000, 350));
        assert_eq!(usage.total(), 2350);
    }

    #[test]
    fn test_trajectory_without_interactions() {
        assert_eq!(TokenUsage::from_trajectory(&json!({})).total(), 0);
        assert_eq!(
            TokenUsage::from_trajectory(&json!({"llm_interactions": "bad"})).total(),
            0
        );
    }

    #[test]
    fn test_usage_report_variants() {
        assert_eq!(
            TokenUsage::from_usage_report(&json!({"total_tokens": 900})).total(),
            900
        );
        assert_eq!(
            TokenUsage::from_usage_report(&json!({"input_tokens": 10, "output_tokens": 5})),
            TokenUsage::new(10, 5)
        );
        assert_eq!(
            TokenUsage::from_usage_report(&json!({"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10})),
            TokenUsage::new(7, 3)
        );
        assert_eq!(TokenUsage::from_usage_report(&json!({"cost": 1.5})).total(), 0);
    }
}
