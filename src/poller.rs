// ABOUTME: Poll loop driving every registered table and delivering batches to a sink
// ABOUTME: Runs checkpoint flush and partition discovery as fixed-delay background tasks

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::PollerSettings;
use crate::engine::{Batch, TableCursor};
use crate::error::TailError;
use crate::record::RecordSink;
use crate::registry::TableRegistry;
use crate::utils::retry_with_backoff;

const DELIVERY_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DELIVERY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Statistics from one polling pass.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub tables_polled: usize,
    pub records: u64,
    /// Some table returned a full batch
    pub filled: bool,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl PollStats {
    /// Check if the pass completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Drives the registered tables and hands their records to the sink.
pub struct Poller {
    registry: Arc<TableRegistry>,
    sink: Arc<dyn RecordSink>,
    settings: PollerSettings,
}

impl Poller {
    pub fn new(registry: Arc<TableRegistry>, sink: Arc<dyn RecordSink>) -> Self {
        let settings = registry.settings().clone();
        Self {
            registry,
            sink,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Poll every registered table once.
    ///
    /// Up to `parallelism` tables are read concurrently; a table is never read
    /// twice within a pass. A failing table is logged and retried next pass.
    pub async fn run_pass(&self) -> PollStats {
        let start = Instant::now();
        let mut stats = PollStats::default();

        let results: Vec<(String, Result<(usize, bool)>)> =
            stream::iter(self.registry.tables())
                .map(|table| async move {
                    let name = table.alias().to_string();
                    (name, self.poll_table(&table).await)
                })
                .buffer_unordered(self.settings.parallelism.max(1))
                .collect()
                .await;

        for (table, result) in results {
            stats.tables_polled += 1;
            match result {
                Ok((records, filled)) => {
                    stats.records += records as u64;
                    stats.filled |= filled;
                }
                Err(e) => {
                    // Log with :? to show full error chain including root cause
                    tracing::error!("Failed to poll '{}': {:?}", table, e);
                    stats.errors.push(format!("Failed to poll '{}': {}", table, e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    /// Read one batch from a table and deliver it. Returns the number of records
    /// delivered and whether the batch was full.
    async fn poll_table(&self, table: &Arc<TableCursor>) -> Result<(usize, bool)> {
        match table.read_batch(self.settings.batch_size).await {
            Ok(batch) => {
                let filled = batch.filled;
                let delivered = self.deliver(table, batch).await?;
                Ok((delivered, filled))
            }
            Err(TailError::Extraction {
                table: name,
                partial,
                source,
            }) => {
                // Rows read before the failure already moved the cursor; hand them on
                self.deliver(table, *partial).await?;
                Err(anyhow::Error::new(source)
                    .context(format!("Extraction failed on table '{}'", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn deliver(&self, table: &Arc<TableCursor>, batch: Batch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.records.len();
        let sent = retry_with_backoff(
            || self.sink.emit(&batch.records),
            self.settings.delivery_retries,
            DELIVERY_INITIAL_DELAY,
            DELIVERY_MAX_DELAY,
        )
        .await;

        match sent {
            Ok(()) => {
                tracing::debug!("Delivered {} records from '{}'", count, table.alias());
                Ok(count)
            }
            Err(e) => {
                table.rollback(&batch).await;
                Err(e).with_context(|| {
                    format!(
                        "Failed to deliver {} records from '{}'; cursor rolled back",
                        count,
                        table.alias()
                    )
                })
            }
        }
    }

    /// Poll continuously until a shutdown signal arrives.
    ///
    /// The next pass starts immediately when a table filled its batch, otherwise
    /// after `poll_interval`. A pass in flight always completes. On shutdown the
    /// background tasks stop and every table's positions are flushed once more.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Starting poller for {} tables with batch_size={}, poll_interval={:?}, flush_interval={:?}, discover_interval={:?}",
            self.registry.len(),
            self.settings.batch_size,
            self.settings.poll_interval(),
            self.settings.flush_interval(),
            self.settings.discover_interval()
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let flusher = spawn_flusher(
            self.registry.clone(),
            self.settings.flush_interval(),
            stop_rx.clone(),
        );
        let discoverer = spawn_discoverer(
            self.registry.clone(),
            self.settings.discover_interval(),
            stop_rx,
        );

        let mut passes = 0u64;
        loop {
            passes += 1;
            let stats = self.run_pass().await;
            if stats.records > 0 || !stats.is_success() {
                tracing::info!(
                    "Pass {} completed: {} tables, {} records in {}ms",
                    passes,
                    stats.tables_polled,
                    stats.records,
                    stats.duration_ms
                );
            }
            if !stats.is_success() {
                tracing::warn!("Pass {} had {} errors", passes, stats.errors.len());
            }

            let pause = if stats.filled {
                Duration::ZERO
            } else {
                self.settings.poll_interval()
            };
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping poller");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        let _ = stop_tx.send(true);
        for task in [flusher, discoverer] {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        let failed = self.registry.flush_positions().await;
        if failed > 0 {
            anyhow::bail!("Final checkpoint flush failed for {} tables", failed);
        }
        tracing::info!("Poller stopped after {} passes, checkpoints flushed", passes);
        Ok(())
    }
}

/// Write checkpoints every `every`, measured from the end of the previous flush.
fn spawn_flusher(
    registry: Arc<TableRegistry>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tokio::time::sleep(every) => {
                    registry.flush_positions().await;
                }
            }
        }
    })
}

/// Discover new partitions every `every`, measured from the end of the previous run.
fn spawn_discoverer(
    registry: Arc<TableRegistry>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tokio::time::sleep(every) => {
                    let added = registry.discover_partitions().await;
                    if added > 0 {
                        tracing::info!("Partition discovery added {} identities", added);
                    }
                }
            }
        }
    })
}
