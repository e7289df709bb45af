//! Command-line interface for featbench.
//!
//! Provides the `run` command: evaluate agents over a corpus, or pull the
//! images the corpus needs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, RunArgs, RunMode};
