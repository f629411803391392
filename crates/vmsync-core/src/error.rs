//! Error types for vmsync-core.

use crate::client::{ApiError, Operation};
use crate::task::TaskHandle;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for vmsync-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while converging a VM.
///
/// Every variant raised after a remote call carries the [`Operation`] that
/// was in flight, so callers can tell how far a reconciliation got before
/// it stopped.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The concurrency token presented with a mutation was stale.
    ///
    /// Another writer changed the VM between our read and our write. The
    /// caller should re-run the whole reconciliation.
    #[error("{op}: concurrency token rejected: {message}")]
    Conflict {
        /// Step that was rejected
        op: Operation,
        /// Message from the control plane
        message: String,
    },

    /// Desired state is malformed. Raised before any mutating call.
    #[error("invalid desired state: {0}")]
    Validation(String),

    /// Engine configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A task reached FAILED or CANCELED.
    #[error("{op}: task {task} failed: {detail}")]
    TaskFailed {
        /// Step whose task failed
        op: Operation,
        /// Handle of the failed task
        task: TaskHandle,
        /// Error payload reported by the task, verbatim
        detail: String,
    },

    /// A task did not reach a terminal state before the deadline.
    ///
    /// The remote task is not cancelled and may still complete.
    #[error("{op}: task {task} still running after {after:?}")]
    Timeout {
        /// Step that was being waited on
        op: Operation,
        /// Handle of the task that was abandoned
        task: TaskHandle,
        /// Deadline that elapsed
        after: Duration,
    },

    /// The VM or one of its sub-resources no longer exists.
    #[error("{op}: not found: {message}")]
    NotFound {
        /// Step that addressed the missing object
        op: Operation,
        /// Message from the control plane
        message: String,
    },

    /// Any other error returned by the control plane.
    #[error("{op}: {message}")]
    Api {
        /// Step that failed
        op: Operation,
        /// Message from the control plane
        message: String,
    },

    /// A successful create task did not name the entity it created.
    #[error("{op}: task {task} succeeded without reporting an affected entity")]
    MissingEntity {
        /// Step that created the entity
        op: Operation,
        /// Handle of the task
        task: TaskHandle,
    },
}

impl CoreError {
    /// Attach operation context to an error returned by a client call.
    pub fn from_api(op: Operation, err: ApiError) -> Self {
        match err {
            ApiError::Conflict(message) => CoreError::Conflict { op, message },
            ApiError::NotFound(message) => CoreError::NotFound { op, message },
            ApiError::Rejected(message) | ApiError::Transport(message) => {
                CoreError::Api { op, message }
            }
        }
    }

    /// Check if re-running the reconciliation from scratch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Conflict { .. })
    }

    /// Check if this error indicates a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }

    /// The step that was in flight when the error occurred, if any.
    pub fn operation(&self) -> Option<&Operation> {
        match self {
            CoreError::Conflict { op, .. }
            | CoreError::TaskFailed { op, .. }
            | CoreError::Timeout { op, .. }
            | CoreError::NotFound { op, .. }
            | CoreError::Api { op, .. }
            | CoreError::MissingEntity { op, .. } => Some(op),
            CoreError::Validation(_) | CoreError::Config(_) => None,
        }
    }
}
