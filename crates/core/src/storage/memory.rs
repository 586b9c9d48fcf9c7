use super::{records_effect, StateStore};
use crate::error::StoreError;
use crate::types::{
    EffectRecord, IdempotencyKey, NewRun, PipelineRun, RunId, RunState, TaskId, TaskRun,
    Transition,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    runs: HashMap<RunId, PipelineRun>,
    task_runs: BTreeMap<(RunId, TaskId), TaskRun>,
    effects: HashMap<IdempotencyKey, EffectRecord>,
}

/// Non-durable state store for tests and embedding
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic mid-write leaves no partial record behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateStore for InMemoryStateStore {
    fn create_run(&self, run: NewRun) -> Result<PipelineRun, StoreError> {
        let run = PipelineRun {
            run_id: RunId::new(),
            pipeline: run.pipeline,
            pipeline_version: run.pipeline_version,
            fingerprint: run.fingerprint,
            partition: run.partition,
            state: RunState::Running,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.lock().runs.insert(run.run_id, run.clone());
        Ok(run)
    }

    fn register_task(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        key: IdempotencyKey,
        required: bool,
    ) -> Result<TaskRun, StoreError> {
        let mut inner = self.lock();
        if !inner.runs.contains_key(run_id) {
            return Err(StoreError::RunNotFound(*run_id));
        }
        let slot = (*run_id, task_id.clone());
        if inner.task_runs.contains_key(&slot) {
            return Err(StoreError::DuplicateTaskRun {
                run_id: *run_id,
                task_id: task_id.clone(),
            });
        }
        let task_run = TaskRun::pending(*run_id, task_id.clone(), key, required);
        inner.task_runs.insert(slot, task_run.clone());
        Ok(task_run)
    }

    fn transition(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        transition: Transition,
    ) -> Result<TaskRun, StoreError> {
        let mut inner = self.lock();
        let task_run = inner
            .task_runs
            .get_mut(&(*run_id, task_id.clone()))
            .ok_or_else(|| StoreError::TaskRunNotFound {
                run_id: *run_id,
                task_id: task_id.clone(),
            })?;

        // Work on a copy so a rejected transition leaves the record untouched
        let mut updated = task_run.clone();
        if !updated.apply(&transition)? {
            return Ok(updated);
        }
        *task_run = updated.clone();

        if records_effect(&transition) {
            inner
                .effects
                .entry(updated.idempotency_key.clone())
                .or_insert_with(|| EffectRecord {
                    key: updated.idempotency_key.clone(),
                    run_id: *run_id,
                    task_id: task_id.clone(),
                    recorded_at: Utc::now(),
                });
        }
        Ok(updated)
    }

    fn get_state(&self, run_id: &RunId, task_id: &TaskId) -> Result<TaskRun, StoreError> {
        self.lock()
            .task_runs
            .get(&(*run_id, task_id.clone()))
            .cloned()
            .ok_or_else(|| StoreError::TaskRunNotFound {
                run_id: *run_id,
                task_id: task_id.clone(),
            })
    }

    fn task_runs(&self, run_id: &RunId) -> Result<Vec<TaskRun>, StoreError> {
        Ok(self
            .lock()
            .task_runs
            .iter()
            .filter(|((id, _), _)| id == run_id)
            .map(|(_, task_run)| task_run.clone())
            .collect())
    }

    fn get_run(&self, run_id: &RunId) -> Result<PipelineRun, StoreError> {
        self.lock()
            .runs
            .get(run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(*run_id))
    }

    fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let mut runs: Vec<_> = self.lock().runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    fn finish_run(&self, run_id: &RunId, state: RunState) -> Result<PipelineRun, StoreError> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or(StoreError::RunNotFound(*run_id))?;
        if !run.state.is_terminal() {
            run.state = state;
            if state.is_terminal() {
                run.ended_at = Some(Utc::now());
            }
        }
        Ok(run.clone())
    }

    fn effect_for(&self, key: &IdempotencyKey) -> Result<Option<EffectRecord>, StoreError> {
        Ok(self.lock().effects.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;

    #[test]
    fn test_memory_lifecycle() {
        contract::lifecycle(&InMemoryStateStore::new());
    }

    #[test]
    fn test_memory_reuse_does_not_record_effect() {
        contract::reuse_does_not_record_effect(&InMemoryStateStore::new());
    }

    #[test]
    fn test_memory_concurrent_terminal_transitions() {
        contract::concurrent_terminal_transitions(&InMemoryStateStore::new());
    }

    #[test]
    fn test_memory_listing() {
        contract::listing(&InMemoryStateStore::new());
    }
}
