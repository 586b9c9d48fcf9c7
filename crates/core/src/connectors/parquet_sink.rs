use super::record::{columns_of, FieldValue, Record};
use super::ColumnarSink;
use crate::error::ConnectorError;
use crate::types::PipelineVersion;
use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

/// Columnar sink writing one Parquet file per partition through object_store
pub struct ParquetSink {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ParquetSink {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Sink backed by a local directory
    pub fn local(root: PathBuf) -> anyhow::Result<Self> {
        use anyhow::Context;

        std::fs::create_dir_all(&root).context("Failed to create columnar directory")?;
        let store = object_store::local::LocalFileSystem::new_with_prefix(&root)
            .context("Failed to open columnar directory")?;
        Ok(Self::new(Arc::new(store), ""))
    }
}

#[async_trait::async_trait]
impl ColumnarSink for ParquetSink {
    fn location(&self, version: &PipelineVersion, partition: &str) -> String {
        let key = format!("{}/{}/{}.parquet", version, partition, partition);
        if self.prefix.is_empty() {
            key
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    async fn write(
        &self,
        version: &PipelineVersion,
        partition: &str,
        records: &[Record],
    ) -> Result<String, ConnectorError> {
        let location = self.location(version, partition);
        let owned = records.to_vec();
        let data = tokio::task::spawn_blocking(move || encode_parquet(&owned))
            .await
            .map_err(|e| ConnectorError::Sink(format!("parquet encoder panicked: {}", e)))??;

        // A single put replaces the object whole
        self.store
            .put(&ObjectPath::from(location.as_str()), data.into())
            .await
            .map_err(|e| ConnectorError::Sink(format!("failed to write {}: {}", location, e)))?;

        tracing::debug!("Wrote {} records to {}", records.len(), location);
        Ok(location)
    }

    async fn read(&self, location: &str) -> Result<Vec<Record>, ConnectorError> {
        let path = ObjectPath::from(location);
        let data = match self.store.get(&path).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| ConnectorError::Sink(format!("failed to read {}: {}", location, e)))?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(ConnectorError::Sink(format!("no columnar file at {}", location)))
            }
            Err(e) => {
                return Err(ConnectorError::Sink(format!(
                    "failed to read {}: {}",
                    location, e
                )))
            }
        };

        tokio::task::spawn_blocking(move || decode_parquet(data))
            .await
            .map_err(|e| ConnectorError::Sink(format!("parquet decoder panicked: {}", e)))?
    }
}

static NULL: FieldValue = FieldValue::Null;

/// Narrowest type that holds every non-null value of a column
fn infer_type<'a>(values: impl Iterator<Item = &'a FieldValue>) -> DataType {
    let mut seen_int = false;
    let mut seen_float = false;
    for value in values {
        match value {
            FieldValue::Null => {}
            FieldValue::Int(_) => seen_int = true,
            FieldValue::Float(_) => seen_float = true,
            FieldValue::Text(_) => return DataType::Utf8,
        }
    }
    match (seen_int, seen_float) {
        (_, true) => DataType::Float64,
        (true, false) => DataType::Int64,
        (false, false) => DataType::Utf8,
    }
}

fn encode_parquet(records: &[Record]) -> Result<Bytes, ConnectorError> {
    let sink_err = |what: &str, e: &dyn std::fmt::Display| {
        ConnectorError::Sink(format!("parquet {} failed: {}", what, e))
    };

    let columns = columns_of(records);
    if columns.is_empty() {
        return Err(ConnectorError::Sink(
            "refusing to write a file without columns".to_string(),
        ));
    }

    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
    for name in &columns {
        let values: Vec<&FieldValue> = records
            .iter()
            .map(|r| r.get(name).unwrap_or(&NULL))
            .collect();
        let data_type = infer_type(values.iter().copied());
        let array: ArrayRef = match data_type {
            DataType::Int64 => Arc::new(Int64Array::from(
                values
                    .iter()
                    .map(|v| match v {
                        FieldValue::Int(i) => Some(*i),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )),
            DataType::Float64 => Arc::new(Float64Array::from(
                values.iter().map(|v| v.as_f64()).collect::<Vec<_>>(),
            )),
            _ => Arc::new(StringArray::from(
                values
                    .iter()
                    .map(|v| match v {
                        FieldValue::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect::<Vec<_>>(),
            )),
        };
        fields.push(Field::new(name, data_type, true));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    let batch =
        RecordBatch::try_new(schema.clone(), arrays).map_err(|e| sink_err("record batch", &e))?;

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer =
        ArrowWriter::try_new(&mut cursor, schema, None).map_err(|e| sink_err("writer init", &e))?;
    writer.write(&batch).map_err(|e| sink_err("write", &e))?;
    writer.close().map_err(|e| sink_err("close", &e))?;
    Ok(Bytes::from(cursor.into_inner()))
}

fn decode_parquet(data: Bytes) -> Result<Vec<Record>, ConnectorError> {
    let sink_err = |what: &str, e: &dyn std::fmt::Display| {
        ConnectorError::Sink(format!("parquet {} failed: {}", what, e))
    };

    let reader = ParquetRecordBatchReaderBuilder::try_new(data)
        .map_err(|e| sink_err("reader init", &e))?
        .build()
        .map_err(|e| sink_err("reader build", &e))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| sink_err("read batch", &e))?;
        let schema = batch.schema();
        for row in 0..batch.num_rows() {
            let mut record = Record::new();
            for (idx, field) in schema.fields().iter().enumerate() {
                let column = batch.column(idx);
                record.set(field.name().clone(), cell(column.as_ref(), row)?);
            }
            records.push(record);
        }
    }
    Ok(records)
}

fn cell(column: &dyn Array, row: usize) -> Result<FieldValue, ConnectorError> {
    if column.is_null(row) {
        return Ok(FieldValue::Null);
    }
    let any = column.as_any();
    if let Some(ints) = any.downcast_ref::<Int64Array>() {
        Ok(FieldValue::Int(ints.value(row)))
    } else if let Some(floats) = any.downcast_ref::<Float64Array>() {
        Ok(FieldValue::Float(floats.value(row)))
    } else if let Some(strings) = any.downcast_ref::<StringArray>() {
        Ok(FieldValue::Text(strings.value(row).to_string()))
    } else {
        Err(ConnectorError::Sink(format!(
            "unsupported column type {}",
            column.data_type()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn movies() -> Vec<Record> {
        vec![
            Record::new()
                .with("title", FieldValue::Text("Heat".to_string()))
                .with("year", FieldValue::Int(1995))
                .with("rating", FieldValue::Float(8.3)),
            Record::new()
                .with("title", FieldValue::Text("Ronin".to_string()))
                .with("year", FieldValue::Null)
                .with("rating", FieldValue::Int(7)),
        ]
    }

    #[tokio::test]
    async fn test_write_and_read_local() {
        let temp_dir = TempDir::new().unwrap();
        let sink = ParquetSink::local(temp_dir.path().to_path_buf()).unwrap();
        let version = PipelineVersion::new("1");

        let location = sink.write(&version, "crime", &movies()).await.unwrap();
        assert_eq!(location, "1/crime/crime.parquet");
        assert!(temp_dir.path().join("1/crime/crime.parquet").is_file());

        let records = sink.read(&location).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("year"), Some(&FieldValue::Int(1995)));
        assert_eq!(records[1].get("year"), Some(&FieldValue::Null));
        // Mixed int/float columns widen to float
        assert_eq!(records[1].get("rating"), Some(&FieldValue::Float(7.0)));
    }

    #[tokio::test]
    async fn test_in_memory_store_with_prefix() {
        let store = Arc::new(object_store::memory::InMemory::new());
        let sink = ParquetSink::new(store, "/columnar/");
        let version = PipelineVersion::new("2");

        assert_eq!(sink.location(&version, "war"), "columnar/2/war/war.parquet");
        let location = sink.write(&version, "war", &movies()).await.unwrap();
        assert_eq!(sink.read(&location).await.unwrap()[0].get("title"), movies()[0].get("title"));
    }

    #[tokio::test]
    async fn test_missing_file_is_sink_error() {
        let store = Arc::new(object_store::memory::InMemory::new());
        let sink = ParquetSink::new(store, "");
        assert!(matches!(
            sink.read("1/none/none.parquet").await,
            Err(ConnectorError::Sink(_))
        ));
    }

    #[test]
    fn test_infer_type() {
        let text = FieldValue::Text("x".to_string());
        assert_eq!(infer_type([&FieldValue::Int(1), &FieldValue::Null].into_iter()), DataType::Int64);
        assert_eq!(
            infer_type([&FieldValue::Int(1), &FieldValue::Float(1.5)].into_iter()),
            DataType::Float64
        );
        assert_eq!(infer_type([&FieldValue::Int(1), &text].into_iter()), DataType::Utf8);
        assert_eq!(infer_type([&FieldValue::Null].into_iter()), DataType::Utf8);
    }
}
