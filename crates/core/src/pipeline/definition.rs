//! Versioned, immutable pipeline definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::dag::PipelineDag;
use super::retry::RetryPolicy;
use crate::config::{ExecutionConfig, TimeoutConfig};
use crate::error::PipelineError;
use crate::types::{IdempotencyKey, PipelineVersion, TaskId, TaskKind};

/// Domain action of a task, one variant per kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    /// Read a source partition, normalize it and stage the records
    Ingest { partition: String },
    /// Write staged records to the columnar sink
    Convert { partition: String },
    /// Load the partition's columnar file into a warehouse table
    Load {
        partition: String,
        target_table: String,
    },
    /// Run an opaque SQL transform
    Transform { sql: String },
    /// Run a query and require at least `min_rows` rows
    Validate { sql: String, min_rows: u64 },
}

impl TaskAction {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskAction::Ingest { .. } => TaskKind::Ingest,
            TaskAction::Convert { .. } => TaskKind::Convert,
            TaskAction::Load { .. } => TaskKind::Load,
            TaskAction::Transform { .. } => TaskKind::Transform,
            TaskAction::Validate { .. } => TaskKind::Validate,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let blank = |s: &str| s.trim().is_empty();
        match self {
            TaskAction::Ingest { partition } | TaskAction::Convert { partition } => {
                if blank(partition) {
                    return Err("partition must not be empty".to_string());
                }
            }
            TaskAction::Load {
                partition,
                target_table,
            } => {
                if blank(partition) {
                    return Err("partition must not be empty".to_string());
                }
                if blank(target_table) {
                    return Err("target table must not be empty".to_string());
                }
            }
            TaskAction::Transform { sql } | TaskAction::Validate { sql, .. } => {
                if blank(sql) {
                    return Err("sql must not be empty".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Dependency on an upstream task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Upstream {
    pub task: TaskId,
    /// Run even when the upstream task ends without success
    #[serde(default)]
    pub continue_on_failure: bool,
}

/// Specification for a single task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub action: TaskAction,
    #[serde(default)]
    pub upstream: Vec<Upstream>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, action: TaskAction) -> Self {
        Self {
            id: TaskId::new(id),
            action,
            upstream: Vec::new(),
            retry: None,
            timeout: None,
            required: true,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.action.kind()
    }

    pub fn after(mut self, upstream: impl Into<String>) -> Self {
        self.upstream.push(Upstream {
            task: TaskId::new(upstream),
            continue_on_failure: false,
        });
        self
    }

    /// Depend on `upstream` but run regardless of how it ends
    pub fn after_any(mut self, upstream: impl Into<String>) -> Self {
        self.upstream.push(Upstream {
            task: TaskId::new(upstream),
            continue_on_failure: true,
        });
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// A named, versioned composition of tasks
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    name: String,
    version: PipelineVersion,
    tasks: Vec<TaskSpec>,
    max_concurrency: usize,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
    dag: PipelineDag,
    fingerprint: String,
}

impl PipelineDefinition {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            version: PipelineVersion::new(version),
            tasks: Vec::new(),
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &PipelineVersion {
        &self.version
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn dag(&self) -> &PipelineDag {
        &self.dag
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Content hash of tasks and settings
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Effective retry policy for a task
    pub fn retry_policy(&self, task: &TaskSpec) -> RetryPolicy {
        task.retry.unwrap_or(self.retry)
    }

    /// Effective timeout for a task
    pub fn timeout(&self, task: &TaskSpec) -> Option<Duration> {
        task.timeout.or_else(|| self.timeouts.for_kind(task.kind()))
    }

    pub fn idempotency_key(&self, task_id: &TaskId, partition: &str) -> IdempotencyKey {
        IdempotencyKey::derive(&self.version, task_id, partition)
    }
}

/// Builder for [`PipelineDefinition`]; all validation happens in `build`
pub struct PipelineBuilder {
    name: String,
    version: PipelineVersion,
    tasks: Vec<TaskSpec>,
    max_concurrency: usize,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
}

impl PipelineBuilder {
    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Apply concurrency, retry and timeout settings from configuration
    pub fn execution(self, config: &ExecutionConfig) -> Self {
        self.max_concurrency(config.max_concurrency)
            .retry(config.retry.policy())
            .timeouts(config.timeout_seconds.clone())
    }

    pub fn build(self) -> Result<PipelineDefinition, PipelineError> {
        if self.tasks.is_empty() {
            return Err(PipelineError::Empty(self.name));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.id.as_str().trim().is_empty() {
                return Err(PipelineError::InvalidTask {
                    task: task.id.clone(),
                    reason: "task id must not be empty".to_string(),
                });
            }
            if !seen.insert(task.id.clone()) {
                return Err(PipelineError::DuplicateTask(task.id.clone()));
            }
            task.action
                .validate()
                .map_err(|reason| PipelineError::InvalidTask {
                    task: task.id.clone(),
                    reason,
                })?;
            if task.timeout == Some(Duration::ZERO) {
                return Err(PipelineError::InvalidTask {
                    task: task.id.clone(),
                    reason: "timeout must be positive".to_string(),
                });
            }
        }

        for kind in [
            TaskKind::Ingest,
            TaskKind::Convert,
            TaskKind::Load,
            TaskKind::Transform,
            TaskKind::Validate,
        ] {
            if self.timeouts.for_kind(kind) == Some(Duration::ZERO) {
                return Err(PipelineError::InvalidTimeout(kind));
            }
        }

        let dag = PipelineDag::build(&self.tasks)?;
        let fingerprint = fingerprint(
            &self.tasks,
            self.max_concurrency,
            &self.retry,
            &self.timeouts,
        );

        Ok(PipelineDefinition {
            name: self.name,
            version: self.version,
            tasks: self.tasks,
            // Zero would never dispatch anything
            max_concurrency: self.max_concurrency.max(1),
            retry: self.retry,
            timeouts: self.timeouts,
            dag,
            fingerprint,
        })
    }
}

fn fingerprint(
    tasks: &[TaskSpec],
    max_concurrency: usize,
    retry: &RetryPolicy,
    timeouts: &TimeoutConfig,
) -> String {
    use sha2::{Digest, Sha256};

    let mut sorted: Vec<TaskSpec> = tasks.to_vec();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    for task in &mut sorted {
        task.upstream.sort_by(|a, b| a.task.cmp(&b.task));
    }

    let canonical = serde_json::json!({
        "tasks": sorted,
        "max_concurrency": max_concurrency,
        "retry": retry,
        "timeouts": timeouts,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest(id: &str) -> TaskSpec {
        TaskSpec::new(
            id,
            TaskAction::Ingest {
                partition: "action".to_string(),
            },
        )
    }

    #[test]
    fn test_build_valid_definition() {
        let def = PipelineDefinition::builder("movies", "1")
            .task(ingest("ingest"))
            .task(
                TaskSpec::new(
                    "convert",
                    TaskAction::Convert {
                        partition: "action".to_string(),
                    },
                )
                .after("ingest"),
            )
            .max_concurrency(2)
            .build()
            .unwrap();

        assert_eq!(def.name(), "movies");
        assert_eq!(def.tasks().len(), 2);
        assert_eq!(def.max_concurrency(), 2);
        assert_eq!(def.task(&TaskId::new("convert")).unwrap().kind(), TaskKind::Convert);
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let result = PipelineDefinition::builder("movies", "1")
            .task(ingest("ingest"))
            .task(ingest("ingest"))
            .build();
        assert!(matches!(result, Err(PipelineError::DuplicateTask(_))));
    }

    #[test]
    fn test_unknown_upstream_rejected() {
        let result = PipelineDefinition::builder("movies", "1")
            .task(ingest("ingest").after("missing"))
            .build();
        assert!(matches!(result, Err(PipelineError::UnknownUpstream { .. })));
    }

    #[test]
    fn test_invalid_action_rejected_at_build_time() {
        let result = PipelineDefinition::builder("movies", "1")
            .task(TaskSpec::new(
                "load",
                TaskAction::Load {
                    partition: "action".to_string(),
                    target_table: " ".to_string(),
                },
            ))
            .build();
        match result {
            Err(PipelineError::InvalidTask { task, reason }) => {
                assert_eq!(task.as_str(), "load");
                assert!(reason.contains("target table"));
            }
            other => panic!("expected InvalidTask, got {:?}", other.map(|d| d.name().to_string())),
        }
    }

    #[test]
    fn test_empty_definition_rejected() {
        let result = PipelineDefinition::builder("movies", "1").build();
        assert!(matches!(result, Err(PipelineError::Empty(_))));
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = PipelineDefinition::builder("movies", "1")
            .task(ingest("a"))
            .task(ingest("b"))
            .build()
            .unwrap();
        let b = PipelineDefinition::builder("movies", "1")
            .task(ingest("b"))
            .task(ingest("a"))
            .build()
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let changed = PipelineDefinition::builder("movies", "1")
            .task(ingest("a"))
            .task(ingest("b").with_timeout(Duration::from_secs(5)))
            .build()
            .unwrap();
        assert_ne!(a.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_effective_policies() {
        let def = PipelineDefinition::builder("movies", "1")
            .task(ingest("a"))
            .task(ingest("b").with_retry(RetryPolicy::none()).with_timeout(Duration::from_secs(3)))
            .retry(RetryPolicy::fixed(2, Duration::from_secs(1)))
            .timeouts(TimeoutConfig {
                ingest: Some(10),
                ..Default::default()
            })
            .build()
            .unwrap();

        let a = def.task(&TaskId::new("a")).unwrap();
        let b = def.task(&TaskId::new("b")).unwrap();
        assert_eq!(def.retry_policy(a).max_attempts, 2);
        assert_eq!(def.retry_policy(b).max_attempts, 0);
        assert_eq!(def.timeout(a), Some(Duration::from_secs(10)));
        assert_eq!(def.timeout(b), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let result = PipelineDefinition::builder("movies", "1")
            .task(ingest("a").with_timeout(Duration::ZERO))
            .build();
        assert!(matches!(result, Err(PipelineError::InvalidTask { .. })));

        // Applies even when no task of that kind exists
        let result = PipelineDefinition::builder("movies", "1")
            .task(ingest("a"))
            .timeouts(TimeoutConfig {
                transform: Some(0),
                ..Default::default()
            })
            .build();
        assert!(matches!(
            result,
            Err(PipelineError::InvalidTimeout(TaskKind::Transform))
        ));
    }

    #[test]
    fn test_version_changes_idempotency_key() {
        let v1 = PipelineDefinition::builder("movies", "1")
            .task(ingest("a"))
            .build()
            .unwrap();
        let v2 = PipelineDefinition::builder("movies", "2")
            .task(ingest("a"))
            .build()
            .unwrap();
        let id = TaskId::new("a");
        assert_ne!(v1.idempotency_key(&id, "p"), v2.idempotency_key(&id, "p"));
        assert_eq!(v1.idempotency_key(&id, "p"), v1.idempotency_key(&id, "p"));
    }
}
