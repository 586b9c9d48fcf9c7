use super::record::{FieldValue, Record};
use super::sql::{OrderBy, SqlParser, Statement};
use super::{ColumnarSink, LoadSummary, QuerySummary, Warehouse};
use crate::error::ConnectorError;
use anyhow::Context;
use redb::{Database, ReadableTable, TableDefinition};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

const TABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("tables");

/// Embedded warehouse: each table is a JSON row set in redb
#[derive(Clone)]
pub struct LocalWarehouse {
    db: Arc<Database>,
    sink: Arc<dyn ColumnarSink>,
    parser: SqlParser,
}

impl LocalWarehouse {
    /// Open the warehouse; `sink` resolves the locations handed to `load`
    pub fn new(path: PathBuf, sink: Arc<dyn ColumnarSink>) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create warehouse directory")?;
        }

        let db = Database::create(&path).context("Failed to create warehouse database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _tables = write_txn
                .open_table(TABLES)
                .context("Failed to open tables table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self {
            db: Arc::new(db),
            sink,
            parser: SqlParser::new().context("Failed to compile statement grammar")?,
        })
    }

    /// Rows of a table, `None` if it does not exist
    pub fn rows(&self, table: &str) -> anyhow::Result<Option<Vec<Record>>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let tables = read_txn.open_table(TABLES).context("Failed to open table")?;

        match tables.get(table).context("Failed to get table")? {
            Some(guard) => {
                let rows: Vec<Record> =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize rows")?;
                Ok(Some(rows))
            }
            None => Ok(None),
        }
    }

    /// Names of all tables, sorted
    pub fn tables(&self) -> anyhow::Result<Vec<String>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let tables = read_txn.open_table(TABLES).context("Failed to open table")?;

        let mut names = Vec::new();
        for item in tables.iter().context("Failed to iterate tables")? {
            let (key, _value) = item.context("Failed to read item")?;
            names.push(key.value().to_string());
        }
        Ok(names)
    }

    /// Replace the contents of a table in one transaction
    fn replace(&self, table: &str, rows: &[Record]) -> anyhow::Result<()> {
        let value = serde_json::to_vec(rows).context("Failed to serialize rows")?;

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut tables = write_txn.open_table(TABLES).context("Failed to open table")?;
            tables
                .insert(table, value.as_slice())
                .context("Failed to write table")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn required_rows(&self, table: &str) -> Result<Vec<Record>, ConnectorError> {
        self.rows(table)
            .map_err(|e| ConnectorError::Query(format!("{:#}", e)))?
            .ok_or_else(|| ConnectorError::Query(format!("table {} does not exist", table)))
    }

    fn create_table_as(
        &self,
        table: &str,
        sources: &[String],
        order_by: Option<&OrderBy>,
        limit: Option<usize>,
    ) -> Result<QuerySummary, ConnectorError> {
        let mut rows = Vec::new();
        for source in sources {
            rows.extend(self.required_rows(source)?);
        }

        if let Some(order) = order_by {
            if !rows.is_empty() && rows.iter().all(|r| r.get(&order.column).is_none()) {
                return Err(ConnectorError::Query(format!(
                    "unknown column {} in ORDER BY",
                    order.column
                )));
            }
            rows.sort_by(|a, b| compare_rows(a, b, order));
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }

        self.replace(table, &rows)
            .map_err(|e| ConnectorError::Query(format!("{:#}", e)))?;

        Ok(QuerySummary {
            table: Some(table.to_string()),
            rows: rows.len() as u64,
        })
    }
}

/// Numbers before text, nulls last in either direction
fn compare_rows(a: &Record, b: &Record, order: &OrderBy) -> Ordering {
    let null = FieldValue::Null;
    let left = a.get(&order.column).unwrap_or(&null);
    let right = b.get(&order.column).unwrap_or(&null);

    let ordering = match (left, right) {
        (FieldValue::Null, FieldValue::Null) => return Ordering::Equal,
        (FieldValue::Null, _) => return Ordering::Greater,
        (_, FieldValue::Null) => return Ordering::Less,
        (FieldValue::Text(x), FieldValue::Text(y)) => x.cmp(y),
        (FieldValue::Text(_), _) => Ordering::Greater,
        (_, FieldValue::Text(_)) => Ordering::Less,
        (x, y) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
    };

    if order.descending {
        ordering.reverse()
    } else {
        ordering
    }
}

#[async_trait::async_trait]
impl Warehouse for LocalWarehouse {
    async fn load(&self, location: &str, table: &str) -> Result<LoadSummary, ConnectorError> {
        let rows = self
            .sink
            .read(location)
            .await
            .map_err(|e| ConnectorError::Load(e.to_string()))?;

        // Truncate and replace, so reloading the same file is a no-op
        self.replace(table, &rows)
            .map_err(|e| ConnectorError::Load(format!("{:#}", e)))?;

        tracing::info!("Loaded {} rows from {} into {}", rows.len(), location, table);
        Ok(LoadSummary {
            table: table.to_string(),
            rows: rows.len() as u64,
        })
    }

    async fn execute(&self, sql: &str) -> Result<QuerySummary, ConnectorError> {
        match self.parser.parse(sql)? {
            Statement::CountRows { table } => {
                let rows = self.required_rows(&table)?;
                Ok(QuerySummary {
                    table: None,
                    rows: rows.len() as u64,
                })
            }
            Statement::CreateTableAs {
                table,
                sources,
                order_by,
                limit,
            } => self.create_table_as(&table, &sources, order_by.as_ref(), limit),
        }
    }
}
