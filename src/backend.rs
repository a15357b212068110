use crate::config::SourceOptions;
use crate::error::InceptionError;
use crate::model::{quote_ident, Cell};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl RowSet {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn value<'a>(&'a self, row: &'a [Cell], name: &str) -> Option<&'a Cell> {
        self.column_index(name).and_then(|i| row.get(i))
    }
}

#[async_trait]
pub trait Backend: Send {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, InceptionError>;

    async fn query(&mut self, sql: &str) -> Result<RowSet, InceptionError>;

    async fn begin(&mut self) -> Result<(), InceptionError> {
        self.execute("START TRANSACTION").await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), InceptionError> {
        self.execute("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), InceptionError> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    async fn close(&mut self) -> Result<(), InceptionError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, source: &SourceOptions) -> Result<Box<dyn Backend>, InceptionError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMeta {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub auto_increment: Option<String>,
}

impl TableMeta {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

pub fn qualified(db: &str, table: &str) -> String {
    if db.is_empty() {
        quote_ident(table)
    } else {
        format!("{}.{}", quote_ident(db), quote_ident(table))
    }
}

/// A connection whose every call is bounded by the configured timeout.
pub struct Session {
    conn: Box<dyn Backend>,
    timeout: Duration,
}

impl Session {
    pub fn new(conn: Box<dyn Backend>, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    pub async fn execute(&mut self, sql: &str) -> Result<ExecResult, InceptionError> {
        debug!(sql, "backend execute");
        let ms = self.timeout_ms();
        tokio::time::timeout(self.timeout, self.conn.execute(sql))
            .await
            .map_err(|_| InceptionError::Timeout(ms))?
    }

    pub async fn query(&mut self, sql: &str) -> Result<RowSet, InceptionError> {
        debug!(sql, "backend query");
        let ms = self.timeout_ms();
        tokio::time::timeout(self.timeout, self.conn.query(sql))
            .await
            .map_err(|_| InceptionError::Timeout(ms))?
    }

    pub async fn begin(&mut self) -> Result<(), InceptionError> {
        let ms = self.timeout_ms();
        tokio::time::timeout(self.timeout, self.conn.begin())
            .await
            .map_err(|_| InceptionError::Timeout(ms))?
    }

    pub async fn commit(&mut self) -> Result<(), InceptionError> {
        let ms = self.timeout_ms();
        tokio::time::timeout(self.timeout, self.conn.commit())
            .await
            .map_err(|_| InceptionError::Timeout(ms))?
    }

    pub async fn rollback(&mut self) -> Result<(), InceptionError> {
        let ms = self.timeout_ms();
        tokio::time::timeout(self.timeout, self.conn.rollback())
            .await
            .map_err(|_| InceptionError::Timeout(ms))?
    }

    pub async fn close(mut self) -> Result<(), InceptionError> {
        let ms = self.timeout_ms();
        tokio::time::timeout(self.timeout, self.conn.close())
            .await
            .map_err(|_| InceptionError::Timeout(ms))?
    }

    pub async fn table_meta(&mut self, db: &str, table: &str) -> Result<TableMeta, InceptionError> {
        let rs = self
            .query(&format!("SHOW COLUMNS FROM {}", qualified(db, table)))
            .await?;
        let mut meta = TableMeta::default();
        for row in &rs.rows {
            let Some(field) = rs.value(row, "Field").map(|c| c.to_string()) else {
                continue;
            };
            let key = rs.value(row, "Key").map(|c| c.to_string()).unwrap_or_default();
            let extra = rs
                .value(row, "Extra")
                .map(|c| c.to_string())
                .unwrap_or_default();
            if key.eq_ignore_ascii_case("PRI") {
                meta.primary_key.push(field.clone());
            }
            if extra.to_ascii_lowercase().contains("auto_increment") {
                meta.auto_increment = Some(field.clone());
            }
            meta.columns.push(field);
        }
        if meta.columns.is_empty() {
            return Err(InceptionError::NotFound(format!(
                "no columns for table {db}.{table}"
            )));
        }
        Ok(meta)
    }

    pub async fn show_create_table(
        &mut self,
        db: &str,
        table: &str,
    ) -> Result<String, InceptionError> {
        let rs = self
            .query(&format!("SHOW CREATE TABLE {}", qualified(db, table)))
            .await?;
        rs.rows
            .first()
            .and_then(|row| row.get(1))
            .map(|c| c.to_string())
            .ok_or_else(|| InceptionError::NotFound(format!("table {db}.{table}")))
    }

    pub async fn table_exists(&mut self, db: &str, table: &str) -> Result<bool, InceptionError> {
        match self.table_meta(db, table).await {
            Ok(_) => Ok(true),
            Err(InceptionError::Backend(_)) | Err(InceptionError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn database_exists(&mut self, db: &str) -> Result<bool, InceptionError> {
        let rs = self
            .query(&format!(
                "SHOW DATABASES LIKE '{}'",
                crate::model::escape_sql_string(db)
            ))
            .await?;
        // LIKE wildcards may over-match; keep exact names only.
        Ok(rs
            .rows
            .iter()
            .any(|row| row.first().is_some_and(|c| c.to_string() == db)))
    }
}
