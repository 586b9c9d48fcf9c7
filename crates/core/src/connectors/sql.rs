//! The statement subset understood by the local warehouse.
//!
//! ```text
//! SELECT COUNT(*) FROM <table>
//! CREATE OR REPLACE TABLE <table> AS
//!     SELECT * FROM <a> [UNION ALL SELECT * FROM <b> ...]
//!     [ORDER BY <column> [ASC|DESC]] [LIMIT <n>]
//! ```

use crate::error::ConnectorError;
use regex::Regex;

const IDENT: &str = r"[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CountRows {
        table: String,
    },
    CreateTableAs {
        table: String,
        sources: Vec<String>,
        order_by: Option<OrderBy>,
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct SqlParser {
    count: Regex,
    create: Regex,
    tail: Regex,
    union: Regex,
    select: Regex,
}

impl SqlParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            count: Regex::new(&format!(
                r"(?is)^\s*SELECT\s+COUNT\s*\(\s*\*\s*\)\s+FROM\s+({IDENT})\s*;?\s*$"
            ))?,
            create: Regex::new(&format!(
                r"(?is)^\s*CREATE\s+OR\s+REPLACE\s+TABLE\s+({IDENT})\s+AS\s+(.+?)\s*;?\s*$"
            ))?,
            tail: Regex::new(
                r"(?is)^(?P<selects>.+?)(?:\s+ORDER\s+BY\s+(?P<column>[A-Za-z_][A-Za-z0-9_]*)(?:\s+(?P<dir>ASC|DESC))?)?(?:\s+LIMIT\s+(?P<limit>\d+))?$",
            )?,
            union: Regex::new(r"(?i)\s+UNION\s+ALL\s+")?,
            select: Regex::new(&format!(r"(?is)^SELECT\s+\*\s+FROM\s+({IDENT})$"))?,
        })
    }

    pub fn parse(&self, sql: &str) -> Result<Statement, ConnectorError> {
        if let Some(caps) = self.count.captures(sql) {
            return Ok(Statement::CountRows {
                table: caps[1].to_string(),
            });
        }

        let caps = self
            .create
            .captures(sql)
            .ok_or_else(|| unsupported(sql))?;
        let table = caps[1].to_string();
        let body = caps[2].trim();

        let tail = self.tail.captures(body).ok_or_else(|| unsupported(sql))?;
        let order_by = tail.name("column").map(|column| OrderBy {
            column: column.as_str().to_string(),
            descending: tail
                .name("dir")
                .is_some_and(|d| d.as_str().eq_ignore_ascii_case("desc")),
        });
        let limit = match tail.name("limit") {
            Some(n) => Some(n.as_str().parse::<usize>().map_err(|e| {
                ConnectorError::Query(format!("invalid LIMIT '{}': {}", n.as_str(), e))
            })?),
            None => None,
        };

        let mut sources = Vec::new();
        for part in self.union.split(tail["selects"].trim()) {
            let select = self
                .select
                .captures(part.trim())
                .ok_or_else(|| unsupported(sql))?;
            sources.push(select[1].to_string());
        }

        Ok(Statement::CreateTableAs {
            table,
            sources,
            order_by,
            limit,
        })
    }
}

fn unsupported(sql: &str) -> ConnectorError {
    ConnectorError::Query(format!("unsupported statement: {}", sql.trim()))
}
