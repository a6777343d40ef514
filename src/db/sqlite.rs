// ABOUTME: SQLite executor running bounded SELECTs on a blocking worker thread
// ABOUTME: Describes tables with PRAGMA table_info and maps rusqlite values to SqlValue

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::types::{ColumnInfo, SqlRow, SqlValue, TIMESTAMP_FORMAT};
use super::{DbError, Dialect, Executor};
use crate::utils::quote_ident;

/// Executes queries against a SQLite database file.
///
/// rusqlite connections are synchronous, so every call hops onto the blocking
/// pool and serializes on the connection mutex.
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
    catalog: String,
}

impl SqliteExecutor {
    /// Open an existing database file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            bail!("SQLite database '{}' does not exist", path.display());
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open SQLite database '{}'", path.display()))?;

        let catalog = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string());

        tracing::info!("Opened SQLite database '{}' (read-only)", path.display());
        Ok(Self::from_connection(conn, catalog))
    }

    /// Wrap an already open connection, e.g. an in-memory database.
    pub fn from_connection(conn: Connection, catalog: impl Into<String>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            catalog: catalog.into(),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| DbError::Worker("SQLite connection mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| DbError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl Executor for SqliteExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn catalog(&self) -> &str {
        &self.catalog
    }

    fn table_ref(&self, table: &str) -> String {
        quote_ident(table)
    }

    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnInfo>>, DbError> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns = stmt
                .query_map([], |row| {
                    let name: String = row.get(1)?;
                    let declared: Option<String> = row.get(2)?;
                    let not_null: i64 = row.get(3)?;
                    Ok(ColumnInfo::new(name, declared.unwrap_or_default())
                        .with_nullable(not_null == 0))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            if columns.is_empty() {
                Ok(None)
            } else {
                Ok(Some(columns))
            }
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let sql = sql.to_string();
        let bound: Vec<Value> = params.iter().map(to_sqlite_value).collect();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let labels: Arc<Vec<String>> = Arc::new(
                stmt.column_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            );
            let width = labels.len();

            let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(from_sqlite_value(row.get::<_, Value>(idx)?));
                }
                out.push(SqlRow::new(labels.clone(), values));
            }
            Ok(out)
        })
        .await
    }
}

/// Map a bound parameter onto SQLite's storage classes.
///
/// Timestamps are bound as text in the same layout SQLite applications
/// conventionally store them, so lexical comparison matches time order.
fn to_sqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Real(*f),
        SqlValue::Decimal(d) => {
            if d.fract().is_zero() {
                match i64::try_from(*d) {
                    Ok(i) => Value::Integer(i),
                    Err(_) => Value::Text(d.normalize().to_string()),
                }
            } else {
                match f64::try_from(*d) {
                    Ok(f) => Value::Real(f),
                    Err(_) => Value::Text(d.normalize().to_string()),
                }
            }
        }
        SqlValue::Text(s) => Value::Text(s.clone()),
        // cursor predicates normalize this text again, see `Dialect::cursor_expr`
        SqlValue::Timestamp(ts) => Value::Text(ts.format(TIMESTAMP_FORMAT).to_string()),
        SqlValue::TimestampTz(ts) => {
            Value::Text(ts.naive_utc().format(TIMESTAMP_FORMAT).to_string())
        }
        SqlValue::Bytes(b) => Value::Blob(b.clone()),
        other => other.to_text().map_or(Value::Null, Value::Text),
    }
}

fn from_sqlite_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(i),
        Value::Real(f) => SqlValue::Real(f),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Bytes(b),
    }
}
