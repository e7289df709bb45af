//! Outcome classification.

pub mod classifier;

pub use classifier::{classify, Verdict};
