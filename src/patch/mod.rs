//! Patch Applicator.
//!
//! Patches are split into per-file diffs ([`diff`]) and applied one file at
//! a time ([`applicator`]), so a patch that is half right still gets credit
//! for the half that applies.

pub mod applicator;
pub mod diff;

pub use applicator::{PatchApplicationRecord, PatchApplicator, PatchError};
pub use diff::{split_patch, FileDiff};
