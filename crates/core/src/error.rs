//! Error taxonomy for pipeline definition, state storage and task execution.

use std::time::Duration;

use crate::types::{RunId, TaskId, TaskKind, TaskState};

/// Errors raised while building a pipeline definition. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The dependency edges form a cycle.
    #[error("pipeline contains a dependency cycle through task {task}")]
    Cycle { task: TaskId },

    /// Two tasks share an id.
    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// A task names an upstream task that is not defined.
    #[error("task {task} depends on unknown task {upstream}")]
    UnknownUpstream { task: TaskId, upstream: TaskId },

    /// A task lists itself as upstream.
    #[error("task {0} depends on itself")]
    SelfDependency(TaskId),

    /// A task's action is missing a field its kind needs.
    #[error("invalid task {task}: {reason}")]
    InvalidTask { task: TaskId, reason: String },

    /// A per-kind timeout is configured as zero.
    #[error("timeout for {0} tasks must be positive")]
    InvalidTimeout(TaskKind),

    /// The definition has no tasks.
    #[error("pipeline {0} has no tasks")]
    Empty(String),
}

/// Errors raised by the execution state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested state change is not legal from the current state.
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("task run not found: {run_id}/{task_id}")]
    TaskRunNotFound { run_id: RunId, task_id: TaskId },

    /// The task run already exists for this run.
    #[error("task run already registered: {run_id}/{task_id}")]
    DuplicateTaskRun { run_id: RunId, task_id: TaskId },

    /// Underlying storage failure.
    #[error("storage backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Errors reported by external collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    #[error("source error: {0}")]
    Source(String),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("load error: {0}")]
    Load(String),

    #[error("query error: {0}")]
    Query(String),
}

/// Failure of a single task attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("task canceled")]
    Canceled,
}

impl TaskError {
    /// Check if the retry policy may retry this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::Canceled)
    }
}

/// Errors that stop the scheduler from driving a run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The run was created from a different definition.
    #[error("run {run_id} was created by {expected}, not by the loaded definition {actual}")]
    DefinitionMismatch {
        run_id: RunId,
        expected: String,
        actual: String,
    },

    /// Non-terminal tasks remain but nothing can make progress.
    #[error("run {0} stalled with no runnable tasks")]
    Stalled(RunId),
}
