//! Task actions of the movie pipeline, run through the collaborators.

use crate::connectors::{ColumnarSink, Normalizer, RecordSource, Warehouse};
use crate::error::{ConnectorError, TaskError};
use crate::pipeline::{TaskAction, TaskContext, TaskOutcome, TaskRunner, TaskSpec};
use crate::storage::StagingArea;
use std::sync::Arc;

/// Runs each task action against the configured collaborators
pub struct PipelineActions {
    source: Arc<dyn RecordSource>,
    normalizer: Normalizer,
    staging: StagingArea,
    sink: Arc<dyn ColumnarSink>,
    warehouse: Arc<dyn Warehouse>,
}

impl PipelineActions {
    pub fn new(
        source: Arc<dyn RecordSource>,
        normalizer: Normalizer,
        staging: StagingArea,
        sink: Arc<dyn ColumnarSink>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            source,
            normalizer,
            staging,
            sink,
            warehouse,
        }
    }

    async fn ingest(&self, partition: &str, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let records = match self.source.read(partition).await? {
            None => {
                return Ok(TaskOutcome::ShortCircuit {
                    reason: format!("partition {} not found in source", partition),
                })
            }
            Some(records) if records.is_empty() => {
                return Ok(TaskOutcome::ShortCircuit {
                    reason: format!("partition {} has no records", partition),
                })
            }
            Some(records) => records,
        };

        let records = self.normalizer.normalize(partition, records);
        let path = self
            .staging
            .write(&ctx.version, &ctx.partition, partition, &records)
            .await?;

        Ok(TaskOutcome::Completed {
            summary: format!("staged {} records at {}", records.len(), path.display()),
        })
    }

    async fn convert(&self, partition: &str, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let staged = self.staging.location(&ctx.version, &ctx.partition, partition);
        let records = self.staging.read(&staged).await?;
        let location = self.sink.write(&ctx.version, partition, &records).await?;

        Ok(TaskOutcome::Completed {
            summary: format!("wrote {} records to {}", records.len(), location),
        })
    }

    async fn load(
        &self,
        partition: &str,
        target_table: &str,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, TaskError> {
        let location = self.sink.location(&ctx.version, partition);
        let summary = self.warehouse.load(&location, target_table).await?;

        Ok(TaskOutcome::Completed {
            summary: format!("loaded {} rows into {}", summary.rows, summary.table),
        })
    }

    async fn transform(&self, sql: &str) -> Result<TaskOutcome, TaskError> {
        let summary = self.warehouse.execute(sql).await?;
        let summary = match summary.table {
            Some(table) => format!("wrote {} rows to {}", summary.rows, table),
            None => format!("{} rows", summary.rows),
        };
        Ok(TaskOutcome::Completed { summary })
    }

    async fn validate(&self, sql: &str, min_rows: u64) -> Result<TaskOutcome, TaskError> {
        let summary = self.warehouse.execute(sql).await?;
        if summary.rows < min_rows {
            return Err(TaskError::Connector(ConnectorError::Query(format!(
                "validation failed: expected at least {} rows, found {}",
                min_rows, summary.rows
            ))));
        }
        Ok(TaskOutcome::Completed {
            summary: format!("{} rows (minimum {})", summary.rows, min_rows),
        })
    }
}

#[async_trait::async_trait]
impl TaskRunner for PipelineActions {
    async fn run(&self, task: &TaskSpec, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        tracing::debug!(
            "Running {} action for task {} (run {}, attempt {})",
            task.kind().as_str(),
            task.id,
            ctx.run_id,
            ctx.attempt
        );

        match &task.action {
            TaskAction::Ingest { partition } => self.ingest(partition, ctx).await,
            TaskAction::Convert { partition } => self.convert(partition, ctx).await,
            TaskAction::Load {
                partition,
                target_table,
            } => self.load(partition, target_table, ctx).await,
            TaskAction::Transform { sql } => self.transform(sql).await,
            TaskAction::Validate { sql, min_rows } => self.validate(sql, *min_rows).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, MoviePipelineConfig};
    use crate::connectors::{CsvDirectorySource, FieldValue, LocalWarehouse, ParquetSink};
    use crate::pipeline::movies::{movie_pipeline, TRANSFORM_TOP, VALIDATE_TOP};
    use crate::pipeline::{RunMonitor, Scheduler};
    use crate::storage::{RedbStateStore, StateStore};
    use crate::types::{RunNote, RunState, TaskId, TaskState};
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _dir: TempDir,
        store: Arc<RedbStateStore>,
        warehouse: LocalWarehouse,
        scheduler: Scheduler,
    }

    fn write_csv(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(format!("{}.csv", name)), contents).unwrap();
    }

    fn harness(categories: &[&str], min_rows: u64) -> Harness {
        let dir = TempDir::new().unwrap();
        let source_dir = dir.path().join("source");
        std::fs::create_dir_all(&source_dir).unwrap();
        write_csv(
            &source_dir,
            "action",
            "Movie Name,Year,Rating\nHeat,1995,8.3\nRonin,1998,7.2\nTaken,2008,\n",
        );
        write_csv(
            &source_dir,
            "war",
            "Movie Name,Year,Rating\nDunkirk,2017,7.8\n1917,2019,8.2\n",
        );
        write_csv(&source_dir, "horror", "Movie Name,Year,Rating\n");

        let sink = Arc::new(ParquetSink::local(dir.path().join("columnar")).unwrap());
        let warehouse =
            LocalWarehouse::new(dir.path().join("warehouse.redb"), sink.clone()).unwrap();
        let store = Arc::new(RedbStateStore::new(dir.path().join("state.redb")).unwrap());

        let mut aliases = BTreeMap::new();
        aliases.insert("movie_name".to_string(), "title".to_string());
        let actions = PipelineActions::new(
            Arc::new(CsvDirectorySource::new(source_dir)),
            Normalizer::new(aliases),
            StagingArea::new(dir.path().join("staging")).unwrap(),
            sink,
            Arc::new(warehouse.clone()),
        );

        let config = MoviePipelineConfig {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            top_n: 3,
            min_rows,
            ..MoviePipelineConfig::default()
        };
        let definition = movie_pipeline(&config, &ExecutionConfig::default()).unwrap();
        let scheduler = Scheduler::new(Arc::new(definition), store.clone(), Arc::new(actions));

        Harness {
            _dir: dir,
            store,
            warehouse,
            scheduler,
        }
    }

    fn titles(warehouse: &LocalWarehouse, table: &str) -> Vec<String> {
        warehouse
            .rows(table)
            .unwrap()
            .unwrap()
            .iter()
            .map(|r| r.get("title").unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_movie_pipeline_end_to_end() {
        let h = harness(&["action", "war"], 1);

        let run = h
            .scheduler
            .run("2024-05-21", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.state, RunState::Success);
        assert_eq!(titles(&h.warehouse, "imdb_dataset.top_movies"), vec!["Heat", "1917", "Dunkirk"]);

        let action = h.warehouse.rows("imdb_dataset.action").unwrap().unwrap();
        assert_eq!(action.len(), 3);
        assert_eq!(action[0].get("year"), Some(&FieldValue::Int(1995)));
        assert_eq!(action[2].get("rating"), Some(&FieldValue::Null));
    }

    #[tokio::test]
    async fn test_second_run_reuses_and_leaves_warehouse_unchanged() {
        let h = harness(&["action", "war"], 1);

        let first = h
            .scheduler
            .run("2024-05-21", CancellationToken::new())
            .await
            .unwrap();
        let before = h.warehouse.rows("imdb_dataset.top_movies").unwrap();

        let second = h
            .scheduler
            .run("2024-05-21", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.state, RunState::Success);
        for task_run in h.store.task_runs(&second.run_id).unwrap() {
            assert_eq!(
                task_run.note,
                Some(RunNote::Reused {
                    from_run: first.run_id
                }),
                "{}",
                task_run.task_id
            );
        }

        // A new run partition recomputes everything with the same result
        let third = h
            .scheduler
            .run("2024-05-22", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(third.state, RunState::Success);

        let after = h.warehouse.rows("imdb_dataset.top_movies").unwrap();
        assert_eq!(
            serde_json::to_value(&before).unwrap(),
            serde_json::to_value(&after).unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_and_empty_partitions_short_circuit() {
        let h = harness(&["action", "horror", "western"], 1);

        let run = h
            .scheduler
            .run("2024-05-21", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.state, RunState::Success);
        for category in ["horror", "western"] {
            let ingest = h
                .store
                .get_state(&run.run_id, &TaskId::new(format!("ingest_{}", category)))
                .unwrap();
            assert!(matches!(ingest.note, Some(RunNote::ShortCircuit { .. })));

            let load = h
                .store
                .get_state(&run.run_id, &TaskId::new(format!("load_{}", category)))
                .unwrap();
            assert_eq!(load.state, TaskState::Skipped);
        }

        // The ranked union needs every category, so it is skipped too
        let transform = h
            .store
            .get_state(&run.run_id, &TaskId::new(TRANSFORM_TOP))
            .unwrap();
        assert_eq!(transform.state, TaskState::Skipped);
        assert_eq!(h.warehouse.rows("imdb_dataset.action").unwrap().unwrap().len(), 3);
        assert!(h.warehouse.rows("imdb_dataset.top_movies").unwrap().is_none());

        // A success without the aggregate is called out in the report
        let report = RunMonitor::new(h.store.clone()).report(&run.run_id).unwrap();
        assert_eq!(report.short_circuits.len(), 2);
        let text = report.to_string();
        assert!(text.contains("Warning: run succeeded without producing"));
        assert!(text.contains(TRANSFORM_TOP));
        assert!(text.contains(VALIDATE_TOP));
    }

    #[tokio::test]
    async fn test_validation_below_minimum_fails_run() {
        let h = harness(&["war"], 10);

        let run = h
            .scheduler
            .run("2024-05-21", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.state, RunState::Failed);
        let validate = h
            .store
            .get_state(&run.run_id, &TaskId::new(VALIDATE_TOP))
            .unwrap();
        assert_eq!(validate.state, TaskState::Failed);
        assert!(validate.error.unwrap().contains("expected at least 10 rows, found 2"));
        // The default policy allows one retry
        assert_eq!(validate.attempt, 2);
    }
}
