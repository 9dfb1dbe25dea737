//! Error types for fmupool.
//!
//! Errors are split by where they surface:
//! - [`ConfigurationError`] is raised synchronously for invalid arguments.
//! - [`SimulateError`], [`LoadError`] and [`StripError`] are request-level and are
//!   converted into failure outcomes, never raised from a batch run.
//! - [`WorkerFailure`] describes an infrastructure failure of a worker process.
//! - [`PoolError`] is what `SimulationPool::run` can return.

use thiserror::Error;

/// Invalid arguments detected before any simulation runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Request batch is empty")]
    EmptyBatch,

    #[error("Worker count must be positive, got {count}")]
    InvalidWorkerCount {
        count: usize,
    },

    #[error("Unknown result policy '{value}' (expected one of: final, trajectory, raw)")]
    UnknownResultPolicy {
        value: String,
    },

    #[error("Invalid time specification: {reason}")]
    InvalidTimeSpec {
        reason: String,
    },

    #[error("Input has {actual} values, expected {expected}")]
    InputDimensionMismatch {
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported platform: {os} ({bits}bit)")]
    UnsupportedPlatform {
        os: String,
        bits: u32,
    },

    #[error("Model '{path}' is not available on platform {platform}")]
    ModelNotAvailable {
        path: String,
        platform: String,
    },
}

/// Failure of a single `simulate` call on a model handle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulateError {
    #[error("Variable not found: {name}")]
    VariableNotFound {
        name: String,
    },

    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter {
        name: String,
        reason: String,
    },

    #[error("Simulation failed: {message}")]
    Solver {
        message: String,
    },
}

impl SimulateError {
    /// Creates a solver error.
    #[must_use]
    pub fn solver(message: impl Into<String>) -> Self {
        Self::Solver {
            message: message.into(),
        }
    }
}

/// Failure to obtain a model handle from a loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to load model '{path}': {message}")]
pub struct LoadError {
    /// Model path as given in the model reference.
    pub path: String,
    /// Loader-provided reason.
    pub message: String,
}

/// Failure while distilling a raw outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StripError {
    #[error("Output variable not found: {pattern}")]
    VariableNotFound {
        pattern: String,
    },

    #[error("Simulation produced no samples")]
    EmptyTrajectory,
}

/// Abnormal termination of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerFailure {
    #[error("Worker {worker} exited unexpectedly ({status})")]
    Crashed {
        worker: usize,
        status: String,
    },

    #[error("Worker {worker} exceeded the request timeout of {duration_ms}ms")]
    Timeout {
        worker: usize,
        duration_ms: u64,
    },

    #[error("Worker {worker} protocol error: {message}")]
    Protocol {
        worker: usize,
        message: String,
    },
}

impl WorkerFailure {
    /// Returns the slot of the failed worker.
    #[must_use]
    pub const fn worker(&self) -> usize {
        match self {
            Self::Crashed { worker, .. } | Self::Timeout { worker, .. } | Self::Protocol { worker, .. } => {
                *worker
            }
        }
    }
}

/// Top-level error type for pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Failed to spawn worker: {message}")]
    Spawn {
        message: String,
    },

    #[error(
        "All workers failed: {completed} requests completed, {pending} pending after {crashes} crashes"
    )]
    WorkersExhausted {
        completed: usize,
        pending: usize,
        crashes: usize,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl PoolError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if the batch was aborted because no worker survived.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::WorkersExhausted { .. })
    }

    /// Returns true if running the same batch again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        // A fresh run refills every worker slot.
        matches!(self, Self::WorkersExhausted { .. })
    }
}

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_messages() {
        let err = ConfigurationError::InvalidWorkerCount { count: 0 };
        assert!(err.to_string().contains("got 0"));

        let err = ConfigurationError::UnknownResultPolicy {
            value: "median".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("median"));
        assert!(msg.contains("trajectory"));
    }

    #[test]
    fn test_simulate_error_variable_not_found() {
        let err = SimulateError::VariableNotFound {
            name: "speed".to_string(),
        };
        assert_eq!(err.to_string(), "Variable not found: speed");
    }

    #[test]
    fn test_worker_failure_slot() {
        let err = WorkerFailure::Timeout {
            worker: 3,
            duration_ms: 250,
        };
        assert_eq!(err.worker(), 3);
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_pool_error_from_configuration() {
        let err: PoolError = ConfigurationError::EmptyBatch.into();
        assert!(err.is_configuration());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pool_error_exhausted_is_retryable() {
        let err = PoolError::WorkersExhausted {
            completed: 2,
            pending: 3,
            crashes: 4,
        };
        assert!(err.is_exhausted());
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("3 pending"));
        assert!(msg.contains("4 crashes"));
    }

    #[test]
    fn test_pool_error_internal() {
        let err = PoolError::internal("lost slot");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("lost slot"));
    }
}
