use anyhow::{Context, Result};
use reelflow_core::config::{ExecutionConfig, IngestConfig, MoviePipelineConfig};
use reelflow_core::connectors::{CsvDirectorySource, LocalWarehouse, Normalizer, ParquetSink};
use reelflow_core::pipeline::{movie_pipeline, PipelineDefinition, Scheduler};
use reelflow_core::storage::{RedbStateStore, StagingArea};
use reelflow_core::types::RunId;
use reelflow_core::PipelineActions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReelflowConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(flatten)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub pipeline: MoviePipelineConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Locations relative to the data directory (absolute paths are kept)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    #[serde(default = "default_columnar_dir")]
    pub columnar_dir: String,

    #[serde(default = "default_state_file")]
    pub state_file: String,

    #[serde(default = "default_warehouse_file")]
    pub warehouse_file: String,
}

fn default_source_dir() -> String {
    "source".to_string()
}

fn default_staging_dir() -> String {
    "staging".to_string()
}

fn default_columnar_dir() -> String {
    "columnar".to_string()
}

fn default_state_file() -> String {
    "state.redb".to_string()
}

fn default_warehouse_file() -> String {
    "warehouse.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            staging_dir: default_staging_dir(),
            columnar_dir: default_columnar_dir(),
            state_file: default_state_file(),
            warehouse_file: default_warehouse_file(),
        }
    }
}

impl ReelflowConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                execution: ExecutionConfig::default(),
                pipeline: MoviePipelineConfig::default(),
                ingest: IngestConfig::default(),
                storage: StorageConfig::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn source_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.source_dir)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.staging_dir)
    }

    pub fn columnar_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.columnar_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }

    pub fn warehouse_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.warehouse_file)
    }

    /// Marker a `cancel` invocation leaves for the process driving the run
    pub fn cancel_marker(&self, run_id: &RunId) -> PathBuf {
        self.data_dir.join("cancel").join(run_id.to_string())
    }

    /// Report the driving process publishes for `status` while it holds the store
    pub fn status_snapshot(&self, run_id: &RunId) -> PathBuf {
        self.data_dir
            .join("status")
            .join(format!("{}.json", run_id))
    }

    pub fn definition(&self) -> Result<PipelineDefinition> {
        movie_pipeline(&self.pipeline, &self.execution).context("Invalid pipeline definition")
    }
}

/// Components shared by the commands
pub struct AppState {
    pub config: ReelflowConfig,
    pub definition: Arc<PipelineDefinition>,
    pub store: Arc<RedbStateStore>,
}

impl AppState {
    pub fn new(config: ReelflowConfig) -> Result<Self> {
        let definition = Arc::new(config.definition()?);
        let store = Arc::new(
            RedbStateStore::new(config.state_path()).context("Failed to open state store")?,
        );

        Ok(Self {
            config,
            definition,
            store,
        })
    }

    /// Build a scheduler wired to the local collaborators
    pub fn scheduler(&self) -> Result<Scheduler> {
        let sink = Arc::new(
            ParquetSink::local(self.config.columnar_path())
                .context("Failed to create columnar sink")?,
        );
        let warehouse = LocalWarehouse::new(self.config.warehouse_path(), sink.clone())
            .context("Failed to open warehouse")?;
        let staging =
            StagingArea::new(self.config.staging_path()).context("Failed to create staging area")?;

        let actions = PipelineActions::new(
            Arc::new(CsvDirectorySource::new(self.config.source_path())),
            Normalizer::new(self.config.ingest.aliases.clone()),
            staging,
            sink,
            Arc::new(warehouse),
        );

        Ok(Scheduler::new(
            self.definition.clone(),
            self.store.clone(),
            Arc::new(actions),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config =
            ReelflowConfig::load(&dir.path().join("absent.toml"), dir.path().join("data")).unwrap();

        assert_eq!(config.execution.max_concurrency, 4);
        assert_eq!(config.pipeline.categories.len(), 16);
        assert_eq!(config.state_path(), dir.path().join("data").join("state.redb"));
        assert!(dir.path().join("data").is_dir());
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reelflow.toml");
        std::fs::write(
            &path,
            r#"
            max_concurrency = 2

            [retry]
            max_attempts = 3

            [timeout_seconds]
            load = 60

            [pipeline]
            version = "7"
            categories = ["action", "war"]
            top_n = 10

            [ingest.aliases]
            movie_name = "title"

            [storage]
            source_dir = "/srv/movies"
            "#,
        )
        .unwrap();

        let config = ReelflowConfig::load(&path, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.execution.max_concurrency, 2);
        assert_eq!(config.execution.retry.max_attempts, 3);
        assert_eq!(config.execution.timeout_seconds.load, Some(60));
        assert_eq!(config.pipeline.version, "7");
        assert_eq!(config.pipeline.top_n, 10);
        assert_eq!(config.pipeline.dataset, "imdb_dataset");
        assert_eq!(
            config.ingest.aliases.get("movie_name").map(String::as_str),
            Some("title")
        );
        assert_eq!(config.source_path(), PathBuf::from("/srv/movies"));
        assert_eq!(config.staging_path(), dir.path().join("staging"));

        let definition = config.definition().unwrap();
        assert_eq!(definition.tasks().len(), 8);
        assert_eq!(definition.max_concurrency(), 2);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reelflow.toml");
        std::fs::write(&path, "max_concurrency = \"many\"").unwrap();
        assert!(ReelflowConfig::load(&path, dir.path().to_path_buf()).is_err());
    }
}
