//! Asynchronous task tracking.
//!
//! Every mutating call returns a [`TaskHandle`]. [`TaskPoller::wait`] polls
//! it until the task reaches a terminal state or the deadline passes.

use crate::client::{Operation, TaskApi};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Opaque identifier of a server-side task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Check if the task will not change state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a task as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub status: TaskStatus,
    /// Identifiers of the entities the task touched, e.g. a new VM
    #[serde(default)]
    pub entities_affected: Vec<String>,
    /// Error payload of a failed task
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub progress_percentage: Option<u8>,
    #[serde(default)]
    pub completed_time: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// A task in the given state with nothing else reported.
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status,
            entities_affected: Vec::new(),
            error_detail: None,
            progress_percentage: None,
            completed_time: None,
        }
    }
}

/// Result of a task that reached SUCCEEDED.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub handle: TaskHandle,
    pub entities_affected: Vec<String>,
    /// Number of status reads it took
    pub polls: u32,
}

impl TaskOutcome {
    /// The first affected entity. Create calls learn the new id this way.
    pub fn first_affected(&self) -> Option<&str> {
        self.entities_affected.first().map(String::as_str)
    }
}

/// Bounded polling loop over a task handle.
#[derive(Debug, Clone)]
pub struct TaskPoller {
    poll_interval: Duration,
}

impl TaskPoller {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Poll `handle` until it is terminal or `timeout` has elapsed.
    ///
    /// The first read is immediate. On timeout the remote task is left
    /// alone; it may still complete on its own.
    ///
    /// # Errors
    /// * [`CoreError::TaskFailed`] if the task ends FAILED or CANCELED
    /// * [`CoreError::Timeout`] if it is still pending at the deadline
    /// * the mapped client error if a status read fails
    pub async fn wait(
        &self,
        tasks: &dyn TaskApi,
        handle: &TaskHandle,
        op: &Operation,
        timeout: Duration,
    ) -> Result<TaskOutcome> {
        let start = Instant::now();
        let mut polls = 0u32;

        loop {
            polls += 1;
            let info = tasks
                .get_task(handle)
                .await
                .map_err(|e| CoreError::from_api(op.clone(), e))?;

            tracing::debug!(
                task = %handle,
                op = %op,
                status = %info.status,
                progress = info.progress_percentage,
                attempts = polls,
                "Polled task"
            );

            match info.status {
                TaskStatus::Succeeded => {
                    tracing::debug!(
                        task = %handle,
                        op = %op,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts = polls,
                        "Task succeeded"
                    );
                    return Ok(TaskOutcome {
                        handle: handle.clone(),
                        entities_affected: info.entities_affected,
                        polls,
                    });
                }
                TaskStatus::Failed | TaskStatus::Canceled => {
                    let detail = info.error_detail.unwrap_or_else(|| match info.status {
                        TaskStatus::Canceled => "task canceled".to_string(),
                        status => format!("task ended in state {status}"),
                    });
                    tracing::warn!(
                        task = %handle,
                        op = %op,
                        status = %info.status,
                        detail = %detail,
                        "Task did not succeed"
                    );
                    return Err(CoreError::TaskFailed {
                        op: op.clone(),
                        task: handle.clone(),
                        detail,
                    });
                }
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Running => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::warn!(
                    task = %handle,
                    op = %op,
                    elapsed_ms = elapsed.as_millis() as u64,
                    attempts = polls,
                    "Gave up waiting for task"
                );
                return Err(CoreError::Timeout {
                    op: op.clone(),
                    task: handle.clone(),
                    after: timeout,
                });
            }

            sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }
}
