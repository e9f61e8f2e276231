//! Error types for the scaling core
//!
//! Caller-visible failures are returned as values from the public API
//! (`submit`, `cancel`, `manual_scale`, ...). Errors raised inside the
//! periodic loops are logged and never escape the loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Result type alias for scaling core operations
pub type ScalingResult<T> = Result<T, ScalingError>;

/// Errors returned across the public API boundary
#[derive(Debug, Error)]
pub enum ScalingError {
    /// Submission rejected, the caller must back off and retry later
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Task execution exceeded its bound
    #[error("task {task_id} timed out after {timeout:?}")]
    TaskTimeout { task_id: String, timeout: Duration },

    /// The processing function reported a failure
    #[error("task failed: {0}")]
    TaskFailure(String),

    /// A monitoring sample could not be taken (transient)
    #[error("monitoring sample failed: {0}")]
    MonitoringSample(String),

    /// A single retention action failed
    #[error("cleanup action {action} failed for {path}: {reason}")]
    CleanupAction {
        path: String,
        action: String,
        reason: String,
    },

    /// The processor no longer accepts work
    #[error("processor is shutting down")]
    ShuttingDown,

    #[error("unknown worker pool: {0}")]
    UnknownPool(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure recorded on a task record
///
/// Unlike [`ScalingError`] this is cloneable and serializable so it can live
/// inside task snapshots handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskError {
    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }
}
