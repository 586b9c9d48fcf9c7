use crate::connectors::Record;
use crate::error::ConnectorError;
use crate::types::PipelineVersion;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// Staging area for normalized records between ingest and convert.
///
/// Records are stored as gzip-compressed JSON lines at
/// `<root>/<version>/<run_partition>/<partition>.jsonl.gz`.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).context("Failed to create staging directory")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of a partition's staged records
    pub fn location(
        &self,
        version: &PipelineVersion,
        run_partition: &str,
        partition: &str,
    ) -> PathBuf {
        self.root
            .join(&version.0)
            .join(run_partition)
            .join(format!("{}.jsonl.gz", partition))
    }

    /// Stage records, replacing any previous file atomically
    pub async fn write(
        &self,
        version: &PipelineVersion,
        run_partition: &str,
        partition: &str,
        records: &[Record],
    ) -> Result<PathBuf, ConnectorError> {
        for segment in [version.0.as_str(), run_partition, partition] {
            check_segment(segment)?;
        }
        let path = self.location(version, run_partition, partition);
        write_jsonl_gz(&path, records)
            .await
            .map_err(|e| ConnectorError::Staging(format!("{:#}", e)))?;

        tracing::debug!("Staged {} records at {}", records.len(), path.display());
        Ok(path)
    }

    /// Read staged records back
    pub async fn read(&self, path: &Path) -> Result<Vec<Record>, ConnectorError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_jsonl_gz(&path))
            .await
            .map_err(|e| ConnectorError::Staging(format!("staging reader panicked: {}", e)))?
            .map_err(|e| ConnectorError::Staging(format!("{:#}", e)))
    }
}

fn check_segment(segment: &str) -> Result<(), ConnectorError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\'])
    {
        return Err(ConnectorError::Staging(format!(
            "invalid path segment '{}'",
            segment
        )));
    }
    Ok(())
}

async fn write_jsonl_gz(path: &Path, records: &[Record]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for record in records {
        let json = serde_json::to_string(record).context("Failed to serialize record")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write record")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create staging directory")?;
    }

    // Write then rename so readers never see a partial file
    let tmp = path.with_extension("gz.tmp");
    tokio::fs::write(&tmp, compressed)
        .await
        .context("Failed to write staging file")?;
    tokio::fs::rename(&tmp, path)
        .await
        .context("Failed to move staging file into place")?;

    Ok(())
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Record>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open staging file {}", path.display()))?;
    let decoder = GzDecoder::new(file);
    let reader = std::io::BufReader::new(decoder);

    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from staging file")?;
        if line.is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line).context("Failed to parse record")?;
        records.push(record);
    }

    Ok(records)
}
