use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a run id from its textual form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a task, unique within a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version label of a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineVersion(pub String);

impl PipelineVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }
}

impl std::fmt::Display for PipelineVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic key identifying the observable effect of a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// SHA-256 over (pipeline version, task id, run partition)
    pub fn derive(version: &PipelineVersion, task_id: &TaskId, partition: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for part in [version.0.as_str(), task_id.as_str(), partition] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Ingest,
    Convert,
    Load,
    Transform,
    Validate,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ingest => "ingest",
            TaskKind::Convert => "convert",
            TaskKind::Load => "load",
            TaskKind::Transform => "transform",
            TaskKind::Validate => "validate",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a task within one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Retrying,
    Skipped,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Skipped | TaskState::Canceled
        )
    }

    /// Whether moving from `self` to `to` is a legal lifecycle step
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Pending, Queued | Skipped | Canceled) => true,
            (Queued, Running | Success | Canceled) => true,
            (Running, Success | Failed | Retrying | Canceled) => true,
            (Retrying, Queued | Failed | Canceled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::Skipped => "skipped",
            TaskState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall state of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Why a task run ended the way it did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunNote {
    /// Success satisfied by an effect recorded in an earlier run
    Reused { from_run: RunId },
    /// The task found nothing to process
    ShortCircuit { reason: String },
    /// Skipped because `root` failed upstream
    UpstreamFailed { root: TaskId },
    /// Skipped because `origin` short-circuited upstream
    UpstreamShortCircuit { origin: TaskId },
}

/// A requested state change for a task run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: TaskState,
    pub attempt: u32,
    pub error: Option<String>,
    pub note: Option<RunNote>,
}

impl Transition {
    pub fn to(state: TaskState, attempt: u32) -> Self {
        Self {
            to: state,
            attempt,
            error: None,
            note: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_note(mut self, note: RunNote) -> Self {
        self.note = Some(note);
        self
    }
}

/// One entry in a task run's state history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: TaskState,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Execution record of one task within one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: TaskId,
    pub run_id: RunId,
    pub attempt: u32,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub idempotency_key: IdempotencyKey,
    pub required: bool,
    pub note: Option<RunNote>,
    pub history: Vec<StateChange>,
}

impl TaskRun {
    pub fn pending(
        run_id: RunId,
        task_id: TaskId,
        idempotency_key: IdempotencyKey,
        required: bool,
    ) -> Self {
        Self {
            task_id,
            run_id,
            attempt: 0,
            state: TaskState::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            idempotency_key,
            required,
            note: None,
            history: vec![StateChange {
                state: TaskState::Pending,
                attempt: 0,
                at: Utc::now(),
                error: None,
            }],
        }
    }

    /// Apply a transition, enforcing the lifecycle.
    ///
    /// Returns `Ok(false)` when the run is already in the requested terminal
    /// state (no-op), `Ok(true)` when the record changed.
    pub fn apply(&mut self, transition: &Transition) -> Result<bool, StoreError> {
        if self.state.is_terminal() && self.state == transition.to {
            return Ok(false);
        }
        if !self.state.can_transition_to(transition.to) {
            return Err(StoreError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.state,
                to: transition.to,
            });
        }

        let now = Utc::now();
        if transition.to == TaskState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if transition.to.is_terminal() {
            self.ended_at = Some(now);
        }
        if transition.error.is_some() {
            self.error = transition.error.clone();
        }
        if transition.note.is_some() {
            self.note = transition.note.clone();
        }
        self.state = transition.to;
        self.attempt = transition.attempt;
        self.history.push(StateChange {
            state: transition.to,
            attempt: transition.attempt,
            at: now,
            error: transition.error.clone(),
        });
        Ok(true)
    }

    /// Success that actually unblocks downstream work
    pub fn is_satisfied(&self) -> bool {
        self.state == TaskState::Success
            && !matches!(self.note, Some(RunNote::ShortCircuit { .. }))
    }

    /// Whether this run was skipped by a short circuit rather than a failure
    pub fn is_short_circuit_skip(&self) -> bool {
        self.state == TaskState::Skipped
            && matches!(self.note, Some(RunNote::UpstreamShortCircuit { .. }))
    }
}

/// A specific execution of a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub pipeline: String,
    pub pipeline_version: PipelineVersion,
    pub fingerprint: String,
    pub partition: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a pipeline run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub pipeline: String,
    pub pipeline_version: PipelineVersion,
    pub fingerprint: String,
    pub partition: String,
}

/// Record of a task effect keyed by idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectRecord {
    pub key: IdempotencyKey,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub recorded_at: DateTime<Utc>,
}

/// Derive a run's overall state from its task runs
pub fn derive_run_state<'a>(tasks: impl IntoIterator<Item = &'a TaskRun>) -> RunState {
    let mut all_done = true;
    let mut failed = false;
    let mut canceled = false;
    for task in tasks {
        if !task.required {
            continue;
        }
        match task.state {
            TaskState::Success => {}
            TaskState::Skipped if task.is_short_circuit_skip() => {}
            // A required task skipped by a failure can never succeed
            TaskState::Failed | TaskState::Skipped => failed = true,
            TaskState::Canceled => canceled = true,
            _ => all_done = false,
        }
    }
    if canceled {
        RunState::Canceled
    } else if failed {
        RunState::Failed
    } else if all_done {
        RunState::Success
    } else {
        RunState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_run(id: &str) -> TaskRun {
        let run_id = RunId::new();
        let key = IdempotencyKey::derive(&PipelineVersion::new("v1"), &TaskId::new(id), "p");
        TaskRun::pending(run_id, TaskId::new(id), key, true)
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let v = PipelineVersion::new("v1");
        let a = IdempotencyKey::derive(&v, &TaskId::new("load"), "2024-05-21");
        let b = IdempotencyKey::derive(&v, &TaskId::new("load"), "2024-05-21");
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 64);

        let other_version = IdempotencyKey::derive(&PipelineVersion::new("v2"), &TaskId::new("load"), "2024-05-21");
        assert_ne!(a, other_version);

        // Field boundaries are length-prefixed
        let shifted = IdempotencyKey::derive(&PipelineVersion::new("v1l"), &TaskId::new("oad"), "2024-05-21");
        assert_ne!(a, shifted);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut run = task_run("ingest");
        assert!(run.apply(&Transition::to(TaskState::Queued, 1)).unwrap());
        assert!(run.apply(&Transition::to(TaskState::Running, 1)).unwrap());
        assert!(run.started_at.is_some());
        assert!(run
            .apply(&Transition::to(TaskState::Retrying, 1).with_error("boom"))
            .unwrap());
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(run.apply(&Transition::to(TaskState::Queued, 2)).unwrap());
        assert!(run.apply(&Transition::to(TaskState::Running, 2)).unwrap());
        assert!(run.apply(&Transition::to(TaskState::Success, 2)).unwrap());
        assert!(run.ended_at.is_some());
        assert_eq!(run.attempt, 2);
        assert_eq!(run.history.len(), 7);
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut run = task_run("ingest");
        run.apply(&Transition::to(TaskState::Queued, 1)).unwrap();
        run.apply(&Transition::to(TaskState::Running, 1)).unwrap();
        run.apply(&Transition::to(TaskState::Success, 1)).unwrap();

        // Same terminal state is a no-op
        assert!(!run.apply(&Transition::to(TaskState::Success, 1)).unwrap());

        let err = run
            .apply(&Transition::to(TaskState::Failed, 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(run.state, TaskState::Success);
    }

    #[test]
    fn test_pending_cannot_run_directly() {
        let mut run = task_run("ingest");
        assert!(run.apply(&Transition::to(TaskState::Running, 1)).is_err());
        assert!(run.apply(&Transition::to(TaskState::Skipped, 0)).unwrap());
    }

    #[test]
    fn test_derive_run_state() {
        let mut a = task_run("a");
        let mut b = task_run("b");
        assert_eq!(derive_run_state([&a, &b]), RunState::Running);

        a.state = TaskState::Success;
        b.state = TaskState::Skipped;
        b.note = Some(RunNote::UpstreamShortCircuit {
            origin: TaskId::new("a"),
        });
        assert_eq!(derive_run_state([&a, &b]), RunState::Success);

        b.state = TaskState::Failed;
        b.note = None;
        assert_eq!(derive_run_state([&a, &b]), RunState::Failed);

        // A failure decides the outcome even while other tasks still run
        a.state = TaskState::Running;
        assert_eq!(derive_run_state([&a, &b]), RunState::Failed);
        a.state = TaskState::Success;

        // Optional tasks do not decide the outcome
        b.required = false;
        assert_eq!(derive_run_state([&a, &b]), RunState::Success);
    }
}
