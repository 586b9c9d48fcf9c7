//! External collaborators: where records come from, where columnar files go,
//! and the warehouse that serves queries over them.

pub mod csv_source;
pub mod normalize;
pub mod parquet_sink;
pub mod record;
pub mod sql;
pub mod warehouse;

pub use csv_source::CsvDirectorySource;
pub use normalize::{sanitize_columns, Normalizer};
pub use parquet_sink::ParquetSink;
pub use record::{FieldValue, Record};
pub use warehouse::LocalWarehouse;

use crate::error::ConnectorError;
use crate::types::PipelineVersion;
use serde::{Deserialize, Serialize};

/// Source of raw tabular records, one partition per category
#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    /// Partitions currently available, sorted
    async fn list_partitions(&self) -> Result<Vec<String>, ConnectorError>;

    /// Read a partition; `None` when the partition does not exist
    async fn read(&self, partition: &str) -> Result<Option<Vec<Record>>, ConnectorError>;
}

/// Columnar file storage for converted partitions
#[async_trait::async_trait]
pub trait ColumnarSink: Send + Sync {
    /// Deterministic location for a partition of a pipeline version
    fn location(&self, version: &PipelineVersion, partition: &str) -> String;

    /// Write records, replacing any previous file at the same location
    async fn write(
        &self,
        version: &PipelineVersion,
        partition: &str,
        records: &[Record],
    ) -> Result<String, ConnectorError>;

    /// Read a previously written file
    async fn read(&self, location: &str) -> Result<Vec<Record>, ConnectorError>;
}

/// Analytical store that loads columnar files and runs queries
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync {
    /// Load the file at `location` into `table`, replacing its contents
    async fn load(&self, location: &str, table: &str) -> Result<LoadSummary, ConnectorError>;

    /// Execute a statement
    async fn execute(&self, sql: &str) -> Result<QuerySummary, ConnectorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub table: String,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySummary {
    /// Table written by the statement, if any
    pub table: Option<String>,
    /// Rows counted or written
    pub rows: u64,
}
