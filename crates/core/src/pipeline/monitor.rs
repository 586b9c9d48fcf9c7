//! Read-only reporting over pipeline runs.

use super::definition::PipelineDefinition;
use crate::error::StoreError;
use crate::storage::StateStore;
use crate::types::{
    derive_run_state, PipelineRun, RunId, RunNote, RunState, StateChange, TaskId, TaskRun,
    TaskState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Summary of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: PipelineRun,
    /// State derived from the task runs; differs from `run.state` while running
    pub derived_state: RunState,
    pub tasks: Vec<TaskReport>,
    pub counts: BTreeMap<String, usize>,
    pub failures: Vec<FailureReport>,
    #[serde(default)]
    pub short_circuits: Vec<ShortCircuitReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempt: u32,
    pub required: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
    pub note: Option<RunNote>,
}

/// A failed task and the downstream work it took with it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub task_id: TaskId,
    pub error: Option<String>,
    pub attempts: u32,
    pub skipped: Vec<TaskId>,
}

/// A task that found nothing to do and the downstream work it skipped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortCircuitReport {
    pub task_id: TaskId,
    pub reason: String,
    pub skipped: Vec<TaskId>,
}

pub struct RunMonitor {
    store: Arc<dyn StateStore>,
    definition: Option<Arc<PipelineDefinition>>,
}

impl RunMonitor {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            definition: None,
        }
    }

    /// Order tasks of runs created from `definition` topologically
    pub fn with_definition(mut self, definition: Arc<PipelineDefinition>) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn report(&self, run_id: &RunId) -> Result<RunReport, StoreError> {
        let run = self.store.get_run(run_id)?;
        let mut task_runs = self.store.task_runs(run_id)?;
        self.order(&run, &mut task_runs);

        let derived_state = derive_run_state(&task_runs);

        let mut counts = BTreeMap::new();
        for task_run in &task_runs {
            *counts.entry(task_run.state.to_string()).or_insert(0) += 1;
        }

        let failures = task_runs
            .iter()
            .filter(|r| r.state == TaskState::Failed)
            .map(|failed| FailureReport {
                task_id: failed.task_id.clone(),
                error: failed.error.clone(),
                attempts: failed.attempt,
                skipped: task_runs
                    .iter()
                    .filter(|r| {
                        matches!(&r.note, Some(RunNote::UpstreamFailed { root }) if *root == failed.task_id)
                    })
                    .map(|r| r.task_id.clone())
                    .collect(),
            })
            .collect();

        let short_circuits = task_runs
            .iter()
            .filter_map(|origin| match &origin.note {
                Some(RunNote::ShortCircuit { reason }) => Some(ShortCircuitReport {
                    task_id: origin.task_id.clone(),
                    reason: reason.clone(),
                    skipped: task_runs
                        .iter()
                        .filter(|r| {
                            matches!(&r.note, Some(RunNote::UpstreamShortCircuit { origin: o }) if *o == origin.task_id)
                        })
                        .map(|r| r.task_id.clone())
                        .collect(),
                }),
                _ => None,
            })
            .collect();

        let tasks = task_runs.iter().map(TaskReport::from).collect();

        Ok(RunReport {
            run,
            derived_state,
            tasks,
            counts,
            failures,
            short_circuits,
        })
    }

    /// All runs, most recent first
    pub fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        self.store.list_runs()
    }

    pub fn history(&self, run_id: &RunId, task_id: &TaskId) -> Result<Vec<StateChange>, StoreError> {
        Ok(self.store.get_state(run_id, task_id)?.history)
    }

    fn order(&self, run: &PipelineRun, task_runs: &mut [TaskRun]) {
        let dag = self
            .definition
            .as_ref()
            .filter(|d| d.fingerprint() == run.fingerprint)
            .map(|d| d.dag());

        match dag {
            Some(dag) => task_runs.sort_by(|a, b| {
                dag.dispatch_key(&a.task_id).cmp(&dag.dispatch_key(&b.task_id))
            }),
            None => task_runs.sort_by(|a, b| a.task_id.cmp(&b.task_id)),
        }
    }
}

impl From<&TaskRun> for TaskReport {
    fn from(run: &TaskRun) -> Self {
        let duration_secs = match (run.started_at, run.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };
        Self {
            task_id: run.task_id.clone(),
            state: run.state,
            attempt: run.attempt,
            required: run.required,
            started_at: run.started_at,
            ended_at: run.ended_at,
            duration_secs,
            error: run.error.clone(),
            note: run.note.clone(),
        }
    }
}

fn describe_note(note: &RunNote) -> String {
    match note {
        RunNote::Reused { from_run } => format!("reused from {}", from_run),
        RunNote::ShortCircuit { reason } => format!("short circuit: {}", reason),
        RunNote::UpstreamFailed { root } => format!("upstream {} failed", root),
        RunNote::UpstreamShortCircuit { origin } => format!("upstream {} short-circuited", origin),
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run {} ({}@{}, partition {}): {}",
            self.run.run_id,
            self.run.pipeline,
            self.run.pipeline_version,
            self.run.partition,
            self.run.state
        )?;
        if self.derived_state != self.run.state {
            writeln!(f, "Tasks report: {}", self.derived_state)?;
        }
        writeln!(f)?;

        let width = self
            .tasks
            .iter()
            .map(|t| t.task_id.as_str().len())
            .max()
            .unwrap_or(0)
            .max("TASK".len());

        writeln!(f, "{:<width$}  {:<9}  {:>7}  {:>9}  NOTE", "TASK", "STATE", "ATTEMPT", "SECONDS")?;
        for task in &self.tasks {
            let seconds = task
                .duration_secs
                .map(|d| format!("{:.1}", d))
                .unwrap_or_else(|| "-".to_string());
            let note = match (&task.note, &task.error) {
                (Some(note), _) => describe_note(note),
                (None, Some(error)) if task.state != TaskState::Success => error.clone(),
                _ => String::new(),
            };
            writeln!(
                f,
                "{:<width$}  {:<9}  {:>7}  {:>9}  {}",
                task.task_id.as_str(),
                task.state.as_str(),
                task.attempt,
                seconds,
                note
            )?;
        }

        let counts: Vec<String> = self
            .counts
            .iter()
            .map(|(state, n)| format!("{} {}", n, state))
            .collect();
        writeln!(f)?;
        writeln!(f, "{}", counts.join(", "))?;

        for failure in &self.failures {
            writeln!(f)?;
            writeln!(
                f,
                "{} failed after {} attempt(s): {}",
                failure.task_id,
                failure.attempts,
                failure.error.as_deref().unwrap_or("unknown error")
            )?;
            if !failure.skipped.is_empty() {
                let skipped: Vec<&str> = failure.skipped.iter().map(|t| t.as_str()).collect();
                writeln!(f, "  skipped: {}", skipped.join(", "))?;
            }
        }

        for short_circuit in &self.short_circuits {
            writeln!(f)?;
            writeln!(
                f,
                "{} short-circuited: {}",
                short_circuit.task_id, short_circuit.reason
            )?;
            if !short_circuit.skipped.is_empty() {
                let skipped: Vec<&str> = short_circuit.skipped.iter().map(|t| t.as_str()).collect();
                writeln!(f, "  skipped: {}", skipped.join(", "))?;
            }
        }

        let skipped_required: Vec<&str> = self
            .tasks
            .iter()
            .filter(|t| {
                t.required
                    && t.state == TaskState::Skipped
                    && matches!(t.note, Some(RunNote::UpstreamShortCircuit { .. }))
            })
            .map(|t| t.task_id.as_str())
            .collect();
        if self.run.state == RunState::Success && !skipped_required.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "Warning: run succeeded without producing {}",
                skipped_required.join(", ")
            )?;
        }
        Ok(())
    }
}
