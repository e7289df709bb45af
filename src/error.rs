//! Error types for featbench operations.
//!
//! Each subsystem that can fail outside a single evaluation task gets its own
//! enum here:
//! - Container runtime and image handling
//! - Harness configuration loading
//! - Corpus loading and instance validation
//! - The durable results store
//!
//! Per-task failures are not propagated as these errors past the worker
//! boundary; the scheduler converts them into a recorded `TaskError`.

use thiserror::Error;

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Image '{image}' not found locally or in the registry")]
    ImageNotFound { image: String },

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Container '{id}' not ready after {attempts} probes: {reason}")]
    NotReady {
        id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Container execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Failed to copy files to container: {0}")]
    CopyFailed(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Substrings of daemon error messages that indicate a retryable condition.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "timed out",
    "too many",
    "no space left",
    "cannot allocate memory",
    "resource temporarily unavailable",
    "503",
    "502",
    "conflict",
];

impl DockerError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Missing images, bad configuration and exec timeouts are permanent for
    /// the task; daemon hiccups and resource exhaustion are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DockerError::DaemonUnavailable(_) | DockerError::ResourceLimitExceeded(_) => true,
            DockerError::RunFailed(msg) | DockerError::PullFailed { reason: msg, .. } => {
                let lower = msg.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }
}

/// Errors raised while loading or validating the harness configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file '{path}' not found")]
    NotFound { path: String },

    #[error("Failed to parse config file '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("Unknown agent '{0}' (not present in the agent table)")]
    UnknownAgent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading the instance corpus.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("Corpus file '{path}' not found")]
    NotFound { path: String },

    #[error("Failed to parse corpus '{path}' at record {index}: {message}")]
    Parse {
        path: String,
        index: usize,
        message: String,
    },

    #[error("Invalid instance '{instance_id}': {reason}")]
    InvalidInstance { instance_id: String, reason: String },

    #[error("Corpus '{0}' contains no instances")]
    Empty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the durable results store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open results store '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write result: {0}")]
    Write(#[from] std::io::Error),

    #[error("Failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}
