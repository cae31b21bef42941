//! Error types for lag injection, task execution, dispatch and configuration.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by [`LagSpec`](crate::lag::LagSpec) construction and waits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LagError {
    /// `minimum` exceeded `maximum`.
    #[error("invalid lag range: minimum {minimum:?} is greater than maximum {maximum:?}")]
    InvalidLagRange { minimum: Duration, maximum: Duration },
    /// The wait was cancelled and no interrupt handler was supplied.
    /// The cancellation context is still signaled when this is returned.
    #[error("lag wait of {planned:?} interrupted after {elapsed:?}")]
    InterruptedWait { planned: Duration, elapsed: Duration },
}

/// Why a single task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The work returned an error or panicked.
    #[error("task failed: {0}")]
    Failed(String),
    /// The task was cancelled before it could finish.
    #[error("task was cancelled")]
    Cancelled,
    /// `result(timeout)` gave up waiting.
    #[error("timed out after {0:?} waiting for task")]
    Timeout(Duration),
}

/// Errors a [`Dispatcher`](crate::dispatch::Dispatcher) returns from `submit`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher {0} is shut down")]
    Shutdown(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

/// Errors that abort a whole harness run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("submitting task {index} failed: {source}")]
    Dispatch {
        index: usize,
        #[source]
        source: DispatchError,
    },
}

/// Errors from running an experiment end to end.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl From<LagError> for ConfigError {
    fn from(e: LagError) -> Self {
        ConfigError::Invalid {
            field: "lag".to_string(),
            reason: e.to_string(),
        }
    }
}
