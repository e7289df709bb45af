//! Resource limits applied to every evaluation container.

use serde::{Deserialize, Serialize};

/// Resource limits for one evaluation container.
///
/// A value of zero disables the corresponding limit, leaving the daemon
/// default in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 4.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        // Test suites of real projects (numpy builds, torch imports) need room.
        Self {
            memory_mb: 16 * 1024,
            cpu_cores: 4.0,
            max_processes: 4096,
        }
    }
}

impl ExecutionLimits {
    /// Creates new execution limits with the given parameters.
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
        }
    }

    /// Memory limit in bytes, or `None` when unlimited.
    pub fn memory_bytes(&self) -> Option<i64> {
        (self.memory_mb > 0).then(|| (self.memory_mb * 1024 * 1024) as i64)
    }

    /// CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// CPU quota for the configured core count, or `None` when unlimited.
    pub fn cpu_quota(&self) -> Option<i64> {
        (self.cpu_cores > 0.0).then(|| (self.cpu_period() as f64 * self.cpu_cores) as i64)
    }

    /// Process limit, or `None` when unlimited.
    pub fn pids_limit(&self) -> Option<i64> {
        (self.max_processes > 0).then_some(self.max_processes as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.memory_mb, 16384);
        assert_eq!(limits.memory_bytes(), Some(16384 * 1024 * 1024));
        assert_eq!(limits.cpu_quota(), Some(400_000));
        assert_eq!(limits.pids_limit(), Some(4096));
    }

    #[test]
    fn test_zero_disables_limit() {
        let limits = ExecutionLimits::new(0, 0.0, 0);
        assert_eq!(limits.memory_bytes(), None);
        assert_eq!(limits.cpu_quota(), None);
        assert_eq!(limits.pids_limit(), None);
    }

    #[test]
    fn test_fractional_cores() {
        let limits = ExecutionLimits::new(512, 0.5, 50);
        assert_eq!(limits.cpu_quota(), Some(50_000));
    }
}
