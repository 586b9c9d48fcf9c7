use super::{records_effect, StateStore};
use crate::error::StoreError;
use crate::types::{
    EffectRecord, IdempotencyKey, NewRun, PipelineRun, RunId, RunState, TaskId, TaskRun,
    Transition,
};
use anyhow::Context;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const TASK_RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("task_runs");
const EFFECTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("effects");

/// Durable state store using redb
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

fn task_key(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{}/{}", run_id, task_id)
}

impl RedbStateStore {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
            let _task_runs_table = write_txn
                .open_table(TASK_RUNS_TABLE)
                .context("Failed to open task runs table")?;
            let _effects_table = write_txn
                .open_table(EFFECTS_TABLE)
                .context("Failed to open effects table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run.run_id.to_string();
            let value = serde_json::to_vec(run).context("Failed to serialize run")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

impl StateStore for RedbStateStore {
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
        self.put_run(&run)?;
        Ok(run)
    }

    fn register_task(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        key: IdempotencyKey,
        required: bool,
    ) -> Result<TaskRun, StoreError> {
        let task_run = TaskRun::pending(*run_id, task_id.clone(), key, required);

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let runs = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;
            if runs
                .get(run_id.to_string().as_str())
                .context("Failed to get run")?
                .is_none()
            {
                return Err(StoreError::RunNotFound(*run_id));
            }

            let mut table = write_txn
                .open_table(TASK_RUNS_TABLE)
                .context("Failed to open table")?;
            let key = task_key(run_id, task_id);
            if table
                .get(key.as_str())
                .context("Failed to get task run")?
                .is_some()
            {
                return Err(StoreError::DuplicateTaskRun {
                    run_id: *run_id,
                    task_id: task_id.clone(),
                });
            }

            let value = serde_json::to_vec(&task_run).context("Failed to serialize task run")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert task run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(task_run)
    }

    fn transition(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        transition: Transition,
    ) -> Result<TaskRun, StoreError> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let task_run = {
            let mut table = write_txn
                .open_table(TASK_RUNS_TABLE)
                .context("Failed to open table")?;
            let key = task_key(run_id, task_id);

            // Copy out before writing back into the same table
            let current = table
                .get(key.as_str())
                .context("Failed to get task run")?
                .map(|guard| guard.value().to_vec());
            let Some(bytes) = current else {
                return Err(StoreError::TaskRunNotFound {
                    run_id: *run_id,
                    task_id: task_id.clone(),
                });
            };
            let mut task_run: TaskRun =
                serde_json::from_slice(&bytes).context("Failed to deserialize task run")?;

            if !task_run.apply(&transition)? {
                return Ok(task_run);
            }

            let value = serde_json::to_vec(&task_run).context("Failed to serialize task run")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to update task run")?;

            if records_effect(&transition) {
                let mut effects = write_txn
                    .open_table(EFFECTS_TABLE)
                    .context("Failed to open table")?;
                let effect_key = task_run.idempotency_key.0.clone();
                let exists = effects
                    .get(effect_key.as_str())
                    .context("Failed to get effect")?
                    .is_some();
                if !exists {
                    let effect = EffectRecord {
                        key: task_run.idempotency_key.clone(),
                        run_id: *run_id,
                        task_id: task_id.clone(),
                        recorded_at: Utc::now(),
                    };
                    let value = serde_json::to_vec(&effect).context("Failed to serialize effect")?;
                    effects
                        .insert(effect_key.as_str(), value.as_slice())
                        .context("Failed to insert effect")?;
                }
            }

            task_run
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(task_run)
    }

    fn get_state(&self, run_id: &RunId, task_id: &TaskId) -> Result<TaskRun, StoreError> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(TASK_RUNS_TABLE)
            .context("Failed to open table")?;

        let key = task_key(run_id, task_id);
        let value = table.get(key.as_str()).context("Failed to get task run")?;

        match value {
            Some(guard) => {
                let task_run: TaskRun = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize task run")?;
                Ok(task_run)
            }
            None => Err(StoreError::TaskRunNotFound {
                run_id: *run_id,
                task_id: task_id.clone(),
            }),
        }
    }

    fn task_runs(&self, run_id: &RunId) -> Result<Vec<TaskRun>, StoreError> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(TASK_RUNS_TABLE)
            .context("Failed to open table")?;

        // '0' sorts right after '/', bounding the "<run_id>/" prefix
        let start = format!("{}/", run_id);
        let end = format!("{}0", run_id);

        let mut task_runs = Vec::new();
        for item in table
            .range(start.as_str()..end.as_str())
            .context("Failed to iterate task runs")?
        {
            let (_key, value) = item.context("Failed to read item")?;
            let task_run: TaskRun = serde_json::from_slice(value.value())
                .context("Failed to deserialize task run")?;
            task_runs.push(task_run);
        }

        Ok(task_runs)
    }

    fn get_run(&self, run_id: &RunId) -> Result<PipelineRun, StoreError> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = run_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get run")?;

        match value {
            Some(guard) => {
                let run: PipelineRun =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?;
                Ok(run)
            }
            None => Err(StoreError::RunNotFound(*run_id)),
        }
    }

    fn list_runs(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: PipelineRun =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            runs.push(run);
        }

        // Sort by started_at descending (most recent first)
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        Ok(runs)
    }

    fn finish_run(&self, run_id: &RunId, state: RunState) -> Result<PipelineRun, StoreError> {
        let mut run = self.get_run(run_id)?;
        if run.state.is_terminal() {
            return Ok(run);
        }

        run.state = state;
        if state.is_terminal() {
            run.ended_at = Some(Utc::now());
        }
        self.put_run(&run)?;
        Ok(run)
    }

    fn effect_for(&self, key: &IdempotencyKey) -> Result<Option<EffectRecord>, StoreError> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EFFECTS_TABLE)
            .context("Failed to open table")?;

        let value = table.get(key.0.as_str()).context("Failed to get effect")?;
        match value {
            Some(guard) => {
                let effect: EffectRecord = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize effect")?;
                Ok(Some(effect))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use crate::types::TaskState;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RedbStateStore {
        RedbStateStore::new(dir.path().join("state.redb")).unwrap()
    }

    #[test]
    fn test_redb_lifecycle() {
        let dir = TempDir::new().unwrap();
        contract::lifecycle(&store(&dir));
    }

    #[test]
    fn test_redb_reuse_does_not_record_effect() {
        let dir = TempDir::new().unwrap();
        contract::reuse_does_not_record_effect(&store(&dir));
    }

    #[test]
    fn test_redb_concurrent_terminal_transitions() {
        let dir = TempDir::new().unwrap();
        contract::concurrent_terminal_transitions(&store(&dir));
    }

    #[test]
    fn test_redb_listing() {
        let dir = TempDir::new().unwrap();
        contract::listing(&store(&dir));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let task = TaskId::new("load");
        let (run_id, key) = {
            let store = store(&dir);
            let run = store.create_run(contract::new_run()).unwrap();
            let key = IdempotencyKey::derive(&run.pipeline_version, &task, &run.partition);
            store.register_task(&run.run_id, &task, key.clone(), true).unwrap();
            for state in [TaskState::Queued, TaskState::Running, TaskState::Success] {
                store
                    .transition(&run.run_id, &task, Transition::to(state, 1))
                    .unwrap();
            }
            (run.run_id, key)
        };

        let reopened = store(&dir);
        assert_eq!(reopened.get_state(&run_id, &task).unwrap().state, TaskState::Success);
        assert!(reopened.is_idempotent_duplicate(&key).unwrap());
    }
}
