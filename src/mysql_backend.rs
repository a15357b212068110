use crate::backend::{Backend, Connector, ExecResult, RowSet};
use crate::config::SourceOptions;
use crate::error::InceptionError;
use crate::model::Cell;
use async_trait::async_trait;
use mysql::consts::ColumnType;
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlConnector;

#[async_trait]
impl Connector for MysqlConnector {
    async fn connect(&self, source: &SourceOptions) -> Result<Box<dyn Backend>, InceptionError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(source.host.clone()))
            .tcp_port(source.port)
            .user(Some(source.user.clone()))
            .pass(Some(source.password.clone()))
            .db_name(source.db.clone().filter(|db| !db.is_empty()));
        let addr = format!("{}:{}", source.host, source.port);
        let conn = tokio::task::spawn_blocking(move || Conn::new(opts))
            .await
            .map_err(|e| InceptionError::Backend(format!("connect task failed: {e}")))?
            .map_err(|e| match e {
                mysql::Error::IoError(io) => {
                    InceptionError::ConnectionLost(format!("cannot reach {addr}: {io}"))
                }
                other => map_error(other),
            })?;
        info!(host = %source.host, port = source.port, "connected to backend");
        Ok(Box::new(MysqlBackend {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

pub struct MysqlBackend {
    conn: Arc<Mutex<Conn>>,
}

/// Transport failures mean the session is gone; everything else is a statement error.
fn map_error(err: mysql::Error) -> InceptionError {
    match err {
        mysql::Error::IoError(e) => InceptionError::ConnectionLost(e.to_string()),
        mysql::Error::CodecError(e) => InceptionError::ConnectionLost(e.to_string()),
        mysql::Error::MySqlError(e) => InceptionError::Backend(format!(
            "Error {} ({}): {}",
            e.code, e.state, e.message
        )),
        other => InceptionError::Backend(other.to_string()),
    }
}

fn is_integer(ty: ColumnType) -> bool {
    matches!(
        ty,
        ColumnType::MYSQL_TYPE_TINY
            | ColumnType::MYSQL_TYPE_SHORT
            | ColumnType::MYSQL_TYPE_INT24
            | ColumnType::MYSQL_TYPE_LONG
            | ColumnType::MYSQL_TYPE_LONGLONG
            | ColumnType::MYSQL_TYPE_YEAR
    )
}

fn to_cell(value: Value, ty: ColumnType) -> Cell {
    match value {
        Value::NULL => Cell::Null,
        Value::Int(i) => Cell::Int(i),
        Value::UInt(u) => i64::try_from(u)
            .map(Cell::Int)
            .unwrap_or_else(|_| Cell::Text(u.to_string())),
        Value::Float(f) => Cell::Float(f64::from(f)),
        Value::Double(f) => Cell::Float(f),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) if is_integer(ty) => text
                .parse::<i64>()
                .map(Cell::Int)
                .unwrap_or(Cell::Text(text)),
            Ok(text) => Cell::Text(text),
            Err(e) => Cell::Bytes(e.into_bytes()),
        },
        other => Cell::Text(other.as_sql(true).trim_matches('\'').to_string()),
    }
}

impl MysqlBackend {
    async fn blocking<T, F>(&self, f: F) -> Result<T, InceptionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Conn) -> Result<T, mysql::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| InceptionError::Backend(format!("backend task failed: {e}")))?
        .map_err(map_error)
    }
}

#[async_trait]
impl Backend for MysqlBackend {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, InceptionError> {
        let sql = sql.to_string();
        self.blocking(move |conn| {
            conn.query_drop(&sql)?;
            Ok(ExecResult {
                affected_rows: conn.affected_rows(),
                last_insert_id: conn.last_insert_id(),
            })
        })
        .await
    }

    async fn query(&mut self, sql: &str) -> Result<RowSet, InceptionError> {
        let sql = sql.to_string();
        self.blocking(move |conn| {
            let result = conn.query_iter(&sql)?;
            let meta: Vec<(String, ColumnType)> = result
                .columns()
                .as_ref()
                .iter()
                .map(|c| (c.name_str().into_owned(), c.column_type()))
                .collect();
            let mut rows = Vec::new();
            for row in result {
                let values = row?.unwrap();
                rows.push(
                    values
                        .into_iter()
                        .zip(meta.iter())
                        .map(|(v, (_, ty))| to_cell(v, *ty))
                        .collect(),
                );
            }
            Ok(RowSet {
                columns: meta.into_iter().map(|(name, _)| name).collect(),
                rows,
            })
        })
        .await
    }

    async fn close(&mut self) -> Result<(), InceptionError> {
        debug!("closing backend connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_columns_decode_as_ints() {
        assert_eq!(
            to_cell(Value::Bytes(b"42".to_vec()), ColumnType::MYSQL_TYPE_LONG),
            Cell::Int(42)
        );
        assert_eq!(
            to_cell(Value::Bytes(b"42".to_vec()), ColumnType::MYSQL_TYPE_VAR_STRING),
            Cell::Text("42".into())
        );
        assert_eq!(to_cell(Value::NULL, ColumnType::MYSQL_TYPE_LONG), Cell::Null);
        assert_eq!(
            to_cell(Value::Bytes(vec![0xff, 0xfe]), ColumnType::MYSQL_TYPE_BLOB),
            Cell::Bytes(vec![0xff, 0xfe])
        );
    }
}
