use super::definition::TaskSpec;
use crate::error::TaskError;
use crate::types::{IdempotencyKey, PipelineVersion, RunId, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything an attempt knows about where it runs
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub version: PipelineVersion,
    /// Logical run partition, e.g. a date
    pub partition: String,
    pub idempotency_key: IdempotencyKey,
    /// Cancelled when the run is cancelled or the attempt times out
    pub cancel: CancellationToken,
}

/// Successful result of an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { summary: String },
    /// Nothing to process; downstream tasks are skipped
    ShortCircuit { reason: String },
}

/// Executes the action of a task
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: &TaskSpec, ctx: &TaskContext) -> Result<TaskOutcome, TaskError>;
}

/// Run one attempt raced against its timeout and cancellation.
///
/// The action runs in its own task. When the attempt is cut short that task
/// is aborted and awaited, so whatever it held is released before returning.
pub(crate) async fn run_attempt(
    runner: Arc<dyn TaskRunner>,
    task: TaskSpec,
    ctx: TaskContext,
    timeout: Option<Duration>,
) -> Result<TaskOutcome, TaskError> {
    let cancel = ctx.cancel.clone();
    let mut handle = tokio::spawn(async move { runner.run(&task, &ctx).await });

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let interrupted = tokio::select! {
        joined = &mut handle => {
            return match joined {
                Ok(result) => result,
                Err(e) => Err(TaskError::Execution(format!("task panicked: {}", e))),
            };
        }
        _ = cancel.cancelled() => TaskError::Canceled,
        _ = deadline => TaskError::Timeout(timeout.unwrap_or_default()),
    };

    cancel.cancel();
    handle.abort();
    let _ = handle.await;
    Err(interrupted)
}
