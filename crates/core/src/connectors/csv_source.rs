use super::record::{FieldValue, Record};
use super::RecordSource;
use crate::error::ConnectorError;
use csv::{ReaderBuilder, Trim};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Record source reading `<root>/<partition>.csv`
#[derive(Debug, Clone)]
pub struct CsvDirectorySource {
    root: PathBuf,
}

impl CsvDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_path(&self, partition: &str) -> PathBuf {
        self.root.join(format!("{}.csv", partition))
    }
}

#[async_trait::async_trait]
impl RecordSource for CsvDirectorySource {
    async fn list_partitions(&self) -> Result<Vec<String>, ConnectorError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list_csv_files(&root))
            .await
            .map_err(|e| ConnectorError::Source(format!("partition listing panicked: {}", e)))?
    }

    async fn read(&self, partition: &str) -> Result<Option<Vec<Record>>, ConnectorError> {
        if partition.contains(['/', '\\']) || partition == ".." {
            return Err(ConnectorError::Source(format!(
                "invalid partition name '{}'",
                partition
            )));
        }

        let path = self.partition_path(partition);
        if !path.is_file() {
            tracing::debug!("Partition {} not found at {}", partition, path.display());
            return Ok(None);
        }

        tokio::task::spawn_blocking(move || read_csv(&path).map(Some))
            .await
            .map_err(|e| ConnectorError::Source(format!("csv reader panicked: {}", e)))?
    }
}

fn list_csv_files(root: &Path) -> Result<Vec<String>, ConnectorError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut partitions = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            ConnectorError::Source(format!("failed to list {}: {}", root.display(), e))
        })?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("csv")
        {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            partitions.push(stem.to_string());
        }
    }
    partitions.sort();
    Ok(partitions)
}

fn read_csv(path: &Path) -> Result<Vec<Record>, ConnectorError> {
    let source_err =
        |e: csv::Error| ConnectorError::Source(format!("failed to read {}: {}", path.display(), e));

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::Headers)
        .flexible(true)
        .from_path(path)
        .map_err(source_err)?;

    let headers = unique_headers(reader.headers().map_err(source_err)?.iter());

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(source_err)?;
        // Short rows pad with nulls, long rows drop the extra cells
        let record: Record = headers
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = match row.get(i) {
                    Some(cell) if !cell.trim().is_empty() => FieldValue::Text(cell.to_string()),
                    _ => FieldValue::Null,
                };
                (name.clone(), value)
            })
            .collect();
        records.push(record);
    }

    Ok(records)
}

/// Exact duplicate headers get `_2`, `_3` suffixes so no column is lost
fn unique_headers<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for header in headers {
        let mut name = header.to_string();
        let mut i = 1;
        while out.contains(&name) {
            i += 1;
            name = format!("{}_{}", header, i);
        }
        out.push(name);
    }
    out
}
