// ABOUTME: Database execution handle shared by every tracked table
// ABOUTME: Backend-neutral trait plus PostgreSQL and SQLite implementations

pub mod postgres;
pub mod sqlite;
pub mod types;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::config::SourceConfig;
use crate::utils::quote_ident;

pub use postgres::PostgresExecutor;
pub use sqlite::SqliteExecutor;
pub use types::{ColumnInfo, ColumnKind, SqlRow, SqlValue};

/// Errors raised while talking to the database.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("value conversion failed: {0}")]
    Conversion(String),

    #[error("database worker failed: {0}")]
    Worker(String),
}

/// SQL flavour spoken by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn quote_ident(&self, identifier: &str) -> String {
        quote_ident(identifier)
    }

    /// Render the placeholder for the `index`-th (1-based) parameter compared
    /// against `column`.
    ///
    /// PostgreSQL parameters are bound as text and cast to the column type on the
    /// server, so one binding path serves every column type.
    pub fn placeholder(&self, index: usize, column: &ColumnInfo) -> String {
        match self {
            Dialect::Postgres => format!("CAST(${}::text AS {})", index, column.cast_type),
            Dialect::Sqlite => format!("?{}", index),
        }
    }

    /// Expression the cursor compares and orders by for `column`.
    ///
    /// SQLite keeps DATETIME cells as whatever text or number was inserted, so
    /// `2024-01-01T10:00:00` and `2024-01-01 10:00:00.000` do not compare as the
    /// same instant. Both sides of the comparison go through `strftime` instead.
    pub fn cursor_expr(&self, column: &ColumnInfo) -> String {
        let ident = self.quote_ident(&column.name);
        match (self, column.kind) {
            (Dialect::Sqlite, ColumnKind::DateTime) => format!(
                "CASE typeof({ident}) WHEN 'integer' THEN strftime('{fmt}', {ident}, 'unixepoch') \
                 ELSE strftime('{fmt}', {ident}) END",
                ident = ident,
                fmt = SQLITE_TIMESTAMP_FORMAT
            ),
            _ => ident,
        }
    }

    /// Placeholder for a cursor value, normalized the same way as [`Dialect::cursor_expr`].
    pub fn cursor_placeholder(&self, index: usize, column: &ColumnInfo) -> String {
        match (self, column.kind) {
            (Dialect::Sqlite, ColumnKind::DateTime) => {
                format!("strftime('{}', ?{})", SQLITE_TIMESTAMP_FORMAT, index)
            }
            _ => self.placeholder(index, column),
        }
    }
}

/// Millisecond layout produced by SQLite's `strftime` for cursor comparisons.
const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%f";

/// Connection/execution handle capable of running parameterized bounded SELECTs.
///
/// Implementations own their connection pooling; callers share one executor
/// across all tables of a registry.
#[async_trait]
pub trait Executor: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Name of the database/catalog this executor is bound to.
    fn catalog(&self) -> &str;

    /// Fully qualified, quoted reference to a table.
    fn table_ref(&self, table: &str) -> String;

    /// Live column list of a table, `None` when the table does not exist.
    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnInfo>>, DbError>;

    /// Run a SELECT and return every row.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError>;
}

/// Open the executor described by the source configuration.
///
/// Accepts `postgres://` / `postgresql://` URLs and `sqlite://<path>`.
pub async fn connect(source: &SourceConfig) -> Result<Arc<dyn Executor>> {
    let url = source.url.as_str();
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let executor = PostgresExecutor::connect(
            url,
            &source.schema,
            source.pool_size,
            source.allow_self_signed_certs,
        )
        .await?;
        Ok(Arc::new(executor))
    } else if let Some(path) = url.strip_prefix("sqlite://") {
        let executor = SqliteExecutor::open(path)?;
        Ok(Arc::new(executor))
    } else {
        bail!(
            "Unsupported source URL '{}': expected postgres://, postgresql:// or sqlite://",
            crate::utils::redact_url(url)
        )
    }
}
