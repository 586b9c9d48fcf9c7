pub mod memory;
pub mod staging;
pub mod state;

pub use memory::InMemoryStateStore;
pub use staging::StagingArea;
pub use state::RedbStateStore;

use crate::error::StoreError;
use crate::types::{
    EffectRecord, IdempotencyKey, NewRun, PipelineRun, RunId, RunNote, RunState, TaskId,
    TaskRun, TaskState, Transition,
};

/// Execution state store: the single source of truth for run and task state.
///
/// Every write is durable before it returns. Transitions on one task run are
/// serialized and checked against the current state inside the same write.
pub trait StateStore: Send + Sync {
    /// Create a pipeline run in the `running` state
    fn create_run(&self, run: NewRun) -> Result<PipelineRun, StoreError>;

    /// Register a task for a run in the `pending` state
    fn register_task(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        key: IdempotencyKey,
        required: bool,
    ) -> Result<TaskRun, StoreError>;

    /// Apply a state change, rejecting illegal transitions
    fn transition(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        transition: Transition,
    ) -> Result<TaskRun, StoreError>;

    /// Get one task run
    fn get_state(&self, run_id: &RunId, task_id: &TaskId) -> Result<TaskRun, StoreError>;

    /// Get all task runs of a run
    fn task_runs(&self, run_id: &RunId) -> Result<Vec<TaskRun>, StoreError>;

    /// Get a run by ID
    fn get_run(&self, run_id: &RunId) -> Result<PipelineRun, StoreError>;

    /// List all runs, most recent first
    fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError>;

    /// Record the terminal state of a run. Terminal runs are left unchanged.
    fn finish_run(&self, run_id: &RunId, state: RunState) -> Result<PipelineRun, StoreError>;

    /// The effect recorded for an idempotency key, if any
    fn effect_for(&self, key: &IdempotencyKey) -> Result<Option<EffectRecord>, StoreError>;

    /// True if a prior successful task run already produced this key's effect
    fn is_idempotent_duplicate(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        Ok(self.effect_for(key)?.is_some())
    }
}

/// Whether a successful transition produced a new effect worth recording
pub(crate) fn records_effect(transition: &Transition) -> bool {
    transition.to == TaskState::Success
        && !matches!(
            transition.note,
            Some(RunNote::Reused { .. }) | Some(RunNote::ShortCircuit { .. })
        )
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store implementation must share.

    use super::*;
    use crate::types::PipelineVersion;

    pub fn new_run() -> NewRun {
        NewRun {
            pipeline: "movies".to_string(),
            pipeline_version: PipelineVersion::new("1"),
            fingerprint: "abc".to_string(),
            partition: "2024-05-21".to_string(),
        }
    }

    fn key(task: &str) -> IdempotencyKey {
        IdempotencyKey::derive(&PipelineVersion::new("1"), &TaskId::new(task), "2024-05-21")
    }

    pub fn lifecycle(store: &dyn StateStore) {
        let run = store.create_run(new_run()).unwrap();
        assert_eq!(run.state, RunState::Running);

        let task = TaskId::new("load");
        let registered = store.register_task(&run.run_id, &task, key("load"), true).unwrap();
        assert_eq!(registered.state, TaskState::Pending);

        let dup = store.register_task(&run.run_id, &task, key("load"), true);
        assert!(matches!(dup, Err(StoreError::DuplicateTaskRun { .. })));

        store
            .transition(&run.run_id, &task, Transition::to(TaskState::Queued, 1))
            .unwrap();
        store
            .transition(&run.run_id, &task, Transition::to(TaskState::Running, 1))
            .unwrap();
        assert!(!store.is_idempotent_duplicate(&key("load")).unwrap());

        let done = store
            .transition(&run.run_id, &task, Transition::to(TaskState::Success, 1))
            .unwrap();
        assert_eq!(done.state, TaskState::Success);
        assert!(store.is_idempotent_duplicate(&key("load")).unwrap());
        let effect = store.effect_for(&key("load")).unwrap().unwrap();
        assert_eq!(effect.run_id, run.run_id);
        assert_eq!(effect.task_id, task);

        let illegal = store.transition(&run.run_id, &task, Transition::to(TaskState::Failed, 1));
        assert!(matches!(illegal, Err(StoreError::InvalidTransition { .. })));
        assert_eq!(store.get_state(&run.run_id, &task).unwrap().state, TaskState::Success);

        let finished = store.finish_run(&run.run_id, RunState::Success).unwrap();
        assert_eq!(finished.state, RunState::Success);
        assert!(finished.ended_at.is_some());

        // Terminal runs do not change
        let again = store.finish_run(&run.run_id, RunState::Failed).unwrap();
        assert_eq!(again.state, RunState::Success);
    }

    /// Racing workers settle one task; only the first terminal transition applies
    pub fn concurrent_terminal_transitions(store: &dyn StateStore) {
        let run = store.create_run(new_run()).unwrap();
        let task = TaskId::new("load");
        store.register_task(&run.run_id, &task, key("load"), true).unwrap();
        store
            .transition(&run.run_id, &task, Transition::to(TaskState::Queued, 0))
            .unwrap();
        store
            .transition(&run.run_id, &task, Transition::to(TaskState::Running, 1))
            .unwrap();

        let barrier = std::sync::Barrier::new(8);
        let results: Vec<(TaskState, Result<TaskRun, StoreError>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let (run_id, task, barrier) = (&run.run_id, &task, &barrier);
                    scope.spawn(move || {
                        let target = if i % 2 == 0 {
                            TaskState::Success
                        } else {
                            TaskState::Failed
                        };
                        let transition = match target {
                            TaskState::Failed => Transition::to(target, 1).with_error("lost race"),
                            _ => Transition::to(target, 1),
                        };
                        barrier.wait();
                        (target, store.transition(run_id, task, transition))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let settled = store.get_state(&run.run_id, &task).unwrap();
        assert!(settled.state.is_terminal());
        let terminal_changes = settled
            .history
            .iter()
            .filter(|change| change.state.is_terminal())
            .count();
        assert_eq!(terminal_changes, 1);

        for (target, result) in results {
            match result {
                Ok(task_run) => {
                    assert_eq!(target, settled.state);
                    assert_eq!(task_run.state, settled.state);
                }
                Err(StoreError::InvalidTransition { from, to, .. }) => {
                    assert_eq!(from, settled.state);
                    assert_eq!(to, target);
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(
            store.is_idempotent_duplicate(&key("load")).unwrap(),
            settled.state == TaskState::Success
        );
    }

    pub fn reuse_does_not_record_effect(store: &dyn StateStore) {
        let run = store.create_run(new_run()).unwrap();
        let task = TaskId::new("ingest");
        store.register_task(&run.run_id, &task, key("ingest"), true).unwrap();
        store
            .transition(&run.run_id, &task, Transition::to(TaskState::Queued, 0))
            .unwrap();
        store
            .transition(
                &run.run_id,
                &task,
                Transition::to(TaskState::Success, 0).with_note(RunNote::Reused {
                    from_run: RunId::new(),
                }),
            )
            .unwrap();
        assert!(!store.is_idempotent_duplicate(&key("ingest")).unwrap());
    }

    pub fn listing(store: &dyn StateStore) {
        let a = store.create_run(new_run()).unwrap();
        let b = store.create_run(new_run()).unwrap();
        for task in ["b_task", "a_task"] {
            store
                .register_task(&a.run_id, &TaskId::new(task), key(task), true)
                .unwrap();
        }

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().any(|r| r.run_id == b.run_id));

        let tasks = store.task_runs(&a.run_id).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(store.task_runs(&b.run_id).unwrap().is_empty());

        let missing = store.get_run(&RunId::new());
        assert!(matches!(missing, Err(StoreError::RunNotFound(_))));
        let missing_task = store.get_state(&a.run_id, &TaskId::new("nope"));
        assert!(matches!(missing_task, Err(StoreError::TaskRunNotFound { .. })));
    }
}
