// ABOUTME: PostgreSQL executor backed by a small pool of tokio-postgres clients
// ABOUTME: Describes tables via information_schema and converts rows by column type

use anyhow::{Context, Result};
use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Row};

use super::types::{ColumnInfo, SqlRow, SqlValue};
use super::{DbError, Dialect, Executor};
use crate::utils::{quote_ident, redact_url, retry_with_backoff};

/// Executes bounded SELECTs against PostgreSQL.
///
/// Holds `pool_size` independent client connections and hands them out
/// round-robin. A tokio-postgres `Client` pipelines concurrent requests, so a
/// shared reference is all a caller needs; pool exhaustion shows up as latency.
pub struct PostgresExecutor {
    clients: Vec<Client>,
    next: AtomicUsize,
    schema: String,
    catalog: String,
}

impl PostgresExecutor {
    /// Connect `pool_size` clients, retrying transient failures with backoff.
    pub async fn connect(
        url: &str,
        schema: &str,
        pool_size: usize,
        allow_self_signed_certs: bool,
    ) -> Result<Self> {
        let pool_size = pool_size.max(1);
        tracing::info!(
            "Connecting to {} ({} connections, schema '{}')",
            redact_url(url),
            pool_size,
            schema
        );

        let mut clients = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let client = retry_with_backoff(
                || connect_client(url, allow_self_signed_certs),
                3,
                Duration::from_secs(1),
                Duration::from_secs(10),
            )
            .await
            .with_context(|| format!("Failed to connect to {}", redact_url(url)))?;
            clients.push(client);
        }

        let row = clients[0]
            .query_one("SELECT current_database()", &[])
            .await
            .context("Failed to query current database")?;
        let catalog: String = row.get(0);

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            schema: schema.to_string(),
            catalog,
        })
    }

    fn client(&self) -> &Client {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[idx]
    }
}

async fn connect_client(url: &str, allow_self_signed_certs: bool) -> Result<Client> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed_certs)
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .context("Failed to open PostgreSQL connection")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    // Cursor timestamps are kept as naive UTC; bound text must be read the same way
    client
        .batch_execute("SET TIME ZONE 'UTC'")
        .await
        .context("Failed to set session time zone")?;

    Ok(client)
}

#[async_trait]
impl Executor for PostgresExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn catalog(&self) -> &str {
        &self.catalog
    }

    fn table_ref(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnInfo>>, DbError> {
        let rows = self
            .client()
            .query(
                "SELECT column_name, data_type, udt_name, is_nullable
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&self.schema, &table],
            )
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            rows.iter()
                .map(|row| {
                    let name: String = row.get(0);
                    let data_type: String = row.get(1);
                    let udt_name: String = row.get(2);
                    let nullable: String = row.get(3);
                    ColumnInfo::new(name, data_type)
                        .with_cast_type(udt_name)
                        .with_nullable(nullable == "YES")
                })
                .collect(),
        ))
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let text_params: Vec<Option<String>> = params.iter().map(SqlValue::to_text).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = text_params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();

        let rows = self.client().query(sql, &refs).await?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let labels: Arc<Vec<String>> = Arc::new(
            first
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        );

        rows.iter()
            .map(|row| Ok(SqlRow::new(labels.clone(), row_to_values(row)?)))
            .collect()
    }
}

/// Convert every column of a PostgreSQL row into a `SqlValue`.
///
/// Handles the common PostgreSQL types; anything else is read through its text
/// representation when the driver allows it, otherwise it becomes NULL.
pub fn row_to_values(row: &Row) -> Result<Vec<SqlValue>, DbError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?
                .map_or(SqlValue::Null, |v| SqlValue::Integer(v.into()))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?
                .map_or(SqlValue::Null, |v| SqlValue::Integer(v.into()))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Integer)
        } else if *ty == Type::OID {
            row.try_get::<_, Option<u32>>(idx)?
                .map_or(SqlValue::Null, |v| SqlValue::Integer(v.into()))
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx)?
                .map_or(SqlValue::Null, |v| SqlValue::Real(v.into()))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Real)
        } else if *ty == Type::NUMERIC {
            row.try_get::<_, Option<rust_decimal::Decimal>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Decimal)
        } else if *ty == Type::TEXT
            || *ty == Type::VARCHAR
            || *ty == Type::BPCHAR
            || *ty == Type::NAME
        {
            row.try_get::<_, Option<String>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Text)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Timestamp)
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
                .map_or(SqlValue::Null, SqlValue::TimestampTz)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<chrono::NaiveDate>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Date)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Json)
        } else if *ty == Type::UUID {
            row.try_get::<_, Option<uuid::Uuid>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Uuid)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Bytes)
        } else {
            match row.try_get::<_, Option<String>>(idx) {
                Ok(v) => v.map_or(SqlValue::Null, SqlValue::Text),
                Err(_) => {
                    tracing::debug!(
                        "Column '{}' has unsupported type {}; emitting NULL (add a convert expression to cast it)",
                        column.name(),
                        ty
                    );
                    SqlValue::Null
                }
            }
        };
        values.push(value);
    }
    Ok(values)
}
