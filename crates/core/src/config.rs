//! Recognized configuration options for pipeline execution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::pipeline::retry::{Backoff, RetryPolicy};
use crate::types::TaskKind;

/// Scheduler limits applied to every pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub timeout_seconds: TimeoutConfig,
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry: RetryConfig::default(),
            timeout_seconds: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.backoff.base_delay_ms);
        let backoff = match self.backoff.kind {
            BackoffKind::Fixed => Backoff::Fixed { delay: base },
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_millis(self.backoff.max_delay_ms.max(self.backoff.base_delay_ms)),
            },
        };
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub kind: BackoffKind,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Per-kind wall-clock limits in seconds (absent = no limit)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub ingest: Option<u64>,
    pub convert: Option<u64>,
    pub load: Option<u64>,
    pub transform: Option<u64>,
    pub validate: Option<u64>,
}

impl TimeoutConfig {
    pub fn for_kind(&self, kind: TaskKind) -> Option<Duration> {
        let secs = match kind {
            TaskKind::Ingest => self.ingest,
            TaskKind::Convert => self.convert,
            TaskKind::Load => self.load,
            TaskKind::Transform => self.transform,
            TaskKind::Validate => self.validate,
        };
        secs.map(Duration::from_secs)
    }
}

/// Shape of the movie pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoviePipelineConfig {
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    #[serde(default = "default_pipeline_version")]
    pub version: String,

    /// One record-source partition per category
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    /// Warehouse dataset holding one table per category
    #[serde(default = "default_dataset")]
    pub dataset: String,

    #[serde(default = "default_top_table")]
    pub top_table: String,

    #[serde(default = "default_top_n")]
    pub top_n: usize,

    #[serde(default = "default_order_by")]
    pub order_by: String,

    /// Rows the top table must hold for validation to pass
    #[serde(default = "default_min_rows")]
    pub min_rows: u64,
}

fn default_pipeline_name() -> String {
    "load_imdb_movie_datasets".to_string()
}

fn default_pipeline_version() -> String {
    "1".to_string()
}

fn default_categories() -> Vec<String> {
    [
        "action", "adventure", "animation", "biography", "crime", "family", "fantasy",
        "film-noir", "history", "horror", "mystery", "romance", "scifi", "sports", "thriller",
        "war",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn default_dataset() -> String {
    "imdb_dataset".to_string()
}

fn default_top_table() -> String {
    "top_movies".to_string()
}

fn default_top_n() -> usize {
    100
}

fn default_order_by() -> String {
    "rating".to_string()
}

fn default_min_rows() -> u64 {
    1
}

impl Default for MoviePipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            version: default_pipeline_version(),
            categories: default_categories(),
            dataset: default_dataset(),
            top_table: default_top_table(),
            top_n: default_top_n(),
            order_by: default_order_by(),
            min_rows: default_min_rows(),
        }
    }
}

/// Schema normalization applied by the ingest action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Sanitized column name -> canonical column name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}
