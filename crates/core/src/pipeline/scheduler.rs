//! Drives one pipeline run to a terminal state.

use super::definition::PipelineDefinition;
use super::runner::{run_attempt, TaskContext, TaskOutcome, TaskRunner};
use crate::error::{SchedulerError, TaskError};
use crate::storage::StateStore;
use crate::types::{
    derive_run_state, NewRun, PipelineRun, RunId, RunNote, RunState, TaskId, TaskRun, TaskState,
    Transition,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const INTERRUPTED: &str = "attempt interrupted before completion";

/// Scheduler for runs of one pipeline definition
pub struct Scheduler {
    definition: Arc<PipelineDefinition>,
    store: Arc<dyn StateStore>,
    runner: Arc<dyn TaskRunner>,
}

/// Attempts currently executing
struct InFlight {
    tasks: JoinSet<Result<TaskOutcome, TaskError>>,
    attempts: HashMap<tokio::task::Id, (TaskId, u32)>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            attempts: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.attempts.len()
    }

    fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn contains(&self, task_id: &TaskId) -> bool {
        self.attempts.values().any(|(id, _)| id == task_id)
    }

    /// Wait for the next attempt to finish
    async fn next(&mut self) -> Option<(TaskId, u32, Result<TaskOutcome, TaskError>)> {
        let joined = self.tasks.join_next_with_id().await?;
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(e) => (
                e.id(),
                Err(TaskError::Execution(format!("attempt aborted: {}", e))),
            ),
        };
        let (task_id, attempt) = self.attempts.remove(&id)?;
        Some((task_id, attempt, result))
    }
}

impl Scheduler {
    pub fn new(
        definition: Arc<PipelineDefinition>,
        store: Arc<dyn StateStore>,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            definition,
            store,
            runner,
        }
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Create a run with every task registered as pending
    pub fn start(&self, partition: &str) -> Result<RunId, SchedulerError> {
        let run = self.store.create_run(NewRun {
            pipeline: self.definition.name().to_string(),
            pipeline_version: self.definition.version().clone(),
            fingerprint: self.definition.fingerprint().to_string(),
            partition: partition.to_string(),
        })?;

        for task in self.definition.tasks() {
            let key = self.definition.idempotency_key(&task.id, partition);
            self.store
                .register_task(&run.run_id, &task.id, key, task.required)?;
        }

        tracing::info!(
            "Created pipeline run: run_id={}, pipeline={}, version={}, partition={}",
            run.run_id,
            run.pipeline,
            run.pipeline_version,
            partition
        );
        Ok(run.run_id)
    }

    /// Start a run and drive it to completion
    pub async fn run(
        &self,
        partition: &str,
        cancel: CancellationToken,
    ) -> Result<PipelineRun, SchedulerError> {
        let run_id = self.start(partition)?;
        self.drive(run_id, cancel).await
    }

    /// Cancel a run that no scheduler is driving
    pub fn cancel_detached(&self, run_id: &RunId) -> Result<PipelineRun, SchedulerError> {
        cancel_detached(self.store.as_ref(), run_id)
    }

    /// Drive an existing run until every task is terminal.
    ///
    /// Also used to resume a run after a crash: attempts left `running` by the
    /// previous process are treated as failed attempts.
    pub async fn drive(
        &self,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Result<PipelineRun, SchedulerError> {
        let run = self.store.get_run(&run_id)?;
        self.check_definition(&run)?;
        if run.state.is_terminal() {
            return Ok(run);
        }

        tracing::info!(
            "Driving pipeline run: run_id={}, pipeline={}, partition={}",
            run_id,
            run.pipeline,
            run.partition
        );

        let mut retry_at = self.recover(&run_id)?;
        let mut in_flight = InFlight::new();
        let dag = self.definition.dag();
        let max_concurrency = self.definition.max_concurrency();

        loop {
            if cancel.is_cancelled() {
                return self.cancel_in_flight(&run_id, &mut in_flight).await;
            }

            let runs = self.load_runs(&run_id)?;
            if runs.values().all(|r| r.state.is_terminal()) {
                break;
            }

            let mut progressed = false;

            // Skip what can no longer run, queue what became ready
            let resolution = dag.resolve(&runs);
            for (task_id, note) in resolution.blocked {
                let attempt = runs.get(&task_id).map_or(0, |r| r.attempt);
                tracing::info!("Skipping task {} for run {}: {:?}", task_id, run_id, note);
                self.store.transition(
                    &run_id,
                    &task_id,
                    Transition::to(TaskState::Skipped, attempt).with_note(note),
                )?;
                progressed = true;
            }
            for task_id in resolution.ready {
                let attempt = runs.get(&task_id).map_or(0, |r| r.attempt);
                self.store
                    .transition(&run_id, &task_id, Transition::to(TaskState::Queued, attempt))?;
                progressed = true;
            }

            let now = Instant::now();
            let due: Vec<TaskId> = retry_at
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for task_id in due {
                retry_at.remove(&task_id);
                let attempt = runs.get(&task_id).map_or(0, |r| r.attempt);
                self.store
                    .transition(&run_id, &task_id, Transition::to(TaskState::Queued, attempt))?;
                progressed = true;
            }

            // Dispatch queued tasks in (rank, id) order
            let runs = self.load_runs(&run_id)?;
            let mut queued: Vec<&TaskRun> = runs
                .values()
                .filter(|r| r.state == TaskState::Queued && !in_flight.contains(&r.task_id))
                .collect();
            queued.sort_by(|a, b| dag.dispatch_key(&a.task_id).cmp(&dag.dispatch_key(&b.task_id)));

            for task_run in queued {
                if let Some(effect) = self.store.effect_for(&task_run.idempotency_key)? {
                    tracing::info!(
                        "Task {} already produced its effect in run {}, reusing",
                        task_run.task_id,
                        effect.run_id
                    );
                    self.store.transition(
                        &run_id,
                        &task_run.task_id,
                        Transition::to(TaskState::Success, task_run.attempt).with_note(
                            RunNote::Reused {
                                from_run: effect.run_id,
                            },
                        ),
                    )?;
                    progressed = true;
                    continue;
                }

                if in_flight.len() >= max_concurrency {
                    continue;
                }
                self.dispatch(&run, task_run, &cancel, &mut in_flight)?;
                progressed = true;
            }

            if progressed {
                continue;
            }

            if in_flight.is_empty() && retry_at.is_empty() {
                tracing::error!("Pipeline run stalled: run_id={}", run_id);
                return Err(SchedulerError::Stalled(run_id));
            }

            let next_retry = retry_at.values().min().copied();
            tokio::select! {
                _ = cancel.cancelled() => {}
                Some((task_id, attempt, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.complete(&run_id, &task_id, attempt, result, &cancel, &mut retry_at)?;
                }
                _ = sleep_until(next_retry), if next_retry.is_some() => {}
            }
        }

        let tasks = self.store.task_runs(&run_id)?;
        let state = derive_run_state(&tasks);
        let finished = self.store.finish_run(&run_id, state)?;

        match finished.state {
            RunState::Success => {
                tracing::info!("Pipeline run completed: run_id={}", run_id)
            }
            state => tracing::error!("Pipeline run finished: run_id={}, state={}", run_id, state),
        }
        Ok(finished)
    }

    fn check_definition(&self, run: &PipelineRun) -> Result<(), SchedulerError> {
        if run.pipeline_version != *self.definition.version()
            || run.fingerprint != self.definition.fingerprint()
        {
            return Err(SchedulerError::DefinitionMismatch {
                run_id: run.run_id,
                expected: format!("{}@{} ({})", run.pipeline, run.pipeline_version, run.fingerprint),
                actual: format!(
                    "{}@{} ({})",
                    self.definition.name(),
                    self.definition.version(),
                    self.definition.fingerprint()
                ),
            });
        }
        Ok(())
    }

    fn load_runs(&self, run_id: &RunId) -> Result<HashMap<TaskId, TaskRun>, SchedulerError> {
        Ok(self
            .store
            .task_runs(run_id)?
            .into_iter()
            .map(|r| (r.task_id.clone(), r))
            .collect())
    }

    /// Settle attempts a previous process left behind. Returns retry deadlines.
    fn recover(&self, run_id: &RunId) -> Result<HashMap<TaskId, Instant>, SchedulerError> {
        let mut retry_at = HashMap::new();
        let now = Instant::now();

        for task_run in self.store.task_runs(run_id)? {
            match task_run.state {
                TaskState::Running => {
                    let policy = self
                        .definition
                        .task(&task_run.task_id)
                        .map(|t| self.definition.retry_policy(t))
                        .unwrap_or_default();
                    let to = if policy.should_retry(task_run.attempt) {
                        retry_at.insert(task_run.task_id.clone(), now);
                        TaskState::Retrying
                    } else {
                        TaskState::Failed
                    };
                    tracing::warn!(
                        "Recovering interrupted task {} (attempt {}) as {}",
                        task_run.task_id,
                        task_run.attempt,
                        to
                    );
                    self.store.transition(
                        run_id,
                        &task_run.task_id,
                        Transition::to(to, task_run.attempt).with_error(INTERRUPTED),
                    )?;
                }
                TaskState::Retrying => {
                    retry_at.insert(task_run.task_id.clone(), now);
                }
                _ => {}
            }
        }

        Ok(retry_at)
    }

    fn dispatch(
        &self,
        run: &PipelineRun,
        task_run: &TaskRun,
        cancel: &CancellationToken,
        in_flight: &mut InFlight,
    ) -> Result<(), SchedulerError> {
        let Some(task) = self.definition.task(&task_run.task_id) else {
            // Fingerprint check guarantees every registered task is defined
            return Err(SchedulerError::Stalled(run.run_id));
        };
        let attempt = task_run.attempt + 1;

        self.store.transition(
            &run.run_id,
            &task.id,
            Transition::to(TaskState::Running, attempt),
        )?;
        tracing::info!(
            "Executing task {} (attempt {}) for run {}",
            task.id,
            attempt,
            run.run_id
        );

        let ctx = TaskContext {
            run_id: run.run_id,
            task_id: task.id.clone(),
            attempt,
            version: run.pipeline_version.clone(),
            partition: run.partition.clone(),
            idempotency_key: task_run.idempotency_key.clone(),
            cancel: cancel.child_token(),
        };
        let timeout = self.definition.timeout(task);
        let handle = in_flight.tasks.spawn(run_attempt(
            self.runner.clone(),
            task.clone(),
            ctx,
            timeout,
        ));
        in_flight
            .attempts
            .insert(handle.id(), (task.id.clone(), attempt));
        Ok(())
    }

    fn complete(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        attempt: u32,
        result: Result<TaskOutcome, TaskError>,
        cancel: &CancellationToken,
        retry_at: &mut HashMap<TaskId, Instant>,
    ) -> Result<(), SchedulerError> {
        let transition = match result {
            Ok(TaskOutcome::Completed { summary }) => {
                tracing::info!(
                    "Task {} succeeded (attempt {}) for run {}: {}",
                    task_id,
                    attempt,
                    run_id,
                    summary
                );
                Transition::to(TaskState::Success, attempt)
            }
            Ok(TaskOutcome::ShortCircuit { reason }) => {
                tracing::info!(
                    "Task {} short-circuited for run {}: {}",
                    task_id,
                    run_id,
                    reason
                );
                Transition::to(TaskState::Success, attempt)
                    .with_note(RunNote::ShortCircuit { reason })
            }
            // Left running; the cancel path settles it
            Err(TaskError::Canceled) if cancel.is_cancelled() => return Ok(()),
            Err(error) => {
                let policy = self
                    .definition
                    .task(task_id)
                    .map(|t| self.definition.retry_policy(t))
                    .unwrap_or_default();

                if error.is_retryable() && policy.should_retry(attempt) {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        "Task {} failed (attempt {}) for run {}, retrying in {:?}: {}",
                        task_id,
                        attempt,
                        run_id,
                        delay,
                        error
                    );
                    retry_at.insert(task_id.clone(), Instant::now() + delay);
                    Transition::to(TaskState::Retrying, attempt).with_error(error.to_string())
                } else {
                    tracing::error!(
                        "Task {} failed (attempt {}) for run {}: {}",
                        task_id,
                        attempt,
                        run_id,
                        error
                    );
                    Transition::to(TaskState::Failed, attempt).with_error(error.to_string())
                }
            }
        };

        self.store.transition(run_id, task_id, transition)?;
        Ok(())
    }

    async fn cancel_in_flight(
        &self,
        run_id: &RunId,
        in_flight: &mut InFlight,
    ) -> Result<PipelineRun, SchedulerError> {
        tracing::warn!(
            "Pipeline run cancelled: run_id={}, in_flight={}",
            run_id,
            in_flight.len()
        );

        // Attempts hold child tokens, so each one aborts its action and returns
        while let Some((task_id, attempt, result)) = in_flight.next().await {
            if let Ok(outcome) = result {
                // Finished before it observed the cancel; keep the result
                let transition = match outcome {
                    TaskOutcome::Completed { .. } => Transition::to(TaskState::Success, attempt),
                    TaskOutcome::ShortCircuit { reason } => {
                        Transition::to(TaskState::Success, attempt)
                            .with_note(RunNote::ShortCircuit { reason })
                    }
                };
                self.store.transition(run_id, &task_id, transition)?;
            }
        }

        cancel_detached(self.store.as_ref(), run_id)
    }
}

/// Mark every non-terminal task of a run and the run itself canceled
pub fn cancel_detached(
    store: &dyn StateStore,
    run_id: &RunId,
) -> Result<PipelineRun, SchedulerError> {
    let run = store.get_run(run_id)?;
    if run.state.is_terminal() {
        return Ok(run);
    }

    for task_run in store.task_runs(run_id)? {
        if !task_run.state.is_terminal() {
            store.transition(
                run_id,
                &task_run.task_id,
                Transition::to(TaskState::Canceled, task_run.attempt)
                    .with_error(TaskError::Canceled.to_string()),
            )?;
        }
    }

    tracing::info!("Pipeline run canceled: run_id={}", run_id);
    Ok(store.finish_run(run_id, RunState::Canceled)?)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
