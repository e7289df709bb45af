//! Prometheus metrics for evaluation runs.
//!
//! # Example
//!
//! ```ignore
//! use featbench::metrics::HarnessMetrics;
//!
//! let metrics = HarnessMetrics::new()?;
//! metrics.record_task("trae-agent", "resolved", 120.5, 48_000);
//! std::fs::write("metrics.prom", metrics.export()?)?;
//! ```

pub mod prometheus;

pub use self::prometheus::HarnessMetrics;
