//! Agent Runner.
//!
//! Installs an agent into a task container, hands it the problem
//! statement, and captures its token usage and the diff it leaves behind.
//!
//! ```text
//! prepare_agent_code → prepare_resources → evaluate → capture diff → reset checkout
//! ```
//!
//! The scheduler only sees [`AgentAdapter`] trait objects; which agent runs
//! is decided by the descriptor table.

pub mod agents;
pub mod executor;
pub mod result;

pub use agents::{
    create_adapter, AgentAdapter, AgentContext, AgentError, AgentKind, AgentRegistry,
};
pub use executor::run_agent;
pub use result::{AgentOutcome, AgentRun, TokenUsage};
