// ABOUTME: Records emitted per extracted row and the sinks that receive them
// ABOUTME: JSON-lines sink for the CLI and an mpsc channel sink for embedding

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use tokio::sync::mpsc;

use crate::db::SqlRow;

/// Header carrying the table's external alias.
pub const TABLE_HEADER: &str = "table";

/// One extracted row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub headers: BTreeMap<String, String>,
    /// Column alias -> value, NULL columns omitted
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn from_row(row: &SqlRow, table_alias: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(TABLE_HEADER.to_string(), table_alias.to_string());
        Self {
            headers,
            body: row.to_json_object(),
        }
    }

    pub fn table(&self) -> Option<&str> {
        self.headers.get(TABLE_HEADER).map(String::as_str)
    }
}

/// Downstream consumer of extracted records.
///
/// A batch is delivered in order. Returning an error makes the poller retry the
/// whole batch, so sinks should tolerate duplicates.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn emit(&self, records: &[Record]) -> Result<()>;
}

/// Writes each record as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct JsonLinesSink;

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn emit(&self, records: &[Record]) -> Result<()> {
        let mut buf = Vec::with_capacity(records.len() * 128);
        for record in records {
            serde_json::to_writer(&mut buf, record).context("Failed to serialize record")?;
            buf.push(b'\n');
        }

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        out.write_all(&buf).context("Failed to write records to stdout")?;
        out.flush().context("Failed to flush stdout")?;
        Ok(())
    }
}

/// Forwards records into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Record>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Record>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end of a channel with room for `capacity` records.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn emit(&self, records: &[Record]) -> Result<()> {
        for record in records {
            self.tx
                .send(record.clone())
                .await
                .map_err(|_| anyhow::anyhow!("Record channel closed"))?;
        }
        Ok(())
    }
}
