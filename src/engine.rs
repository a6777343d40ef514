// ABOUTME: Per-table cursor engine: bounded incremental reads, idle gating, partition discovery
// ABOUTME: Reconciles configured, persisted and live start values when a table is opened

use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

use crate::catalog::TableSchema;
use crate::cursor::idle::after_poll;
use crate::cursor::{
    Checkpoint, Cursor, CursorKind, CursorSnapshot, CursorValue, IdlePolicy, PartitionArena,
    PartitionSlot,
};
use crate::db::{ColumnInfo, ColumnKind, DbError, Executor, SqlRow, SqlValue};
use crate::error::TailError;
use crate::position::{reconcile_partition, reconcile_single, PositionStore};
use crate::query::{SelectionBuilder, IDENTITY_LABEL, MINIMUM_LABEL};
use crate::record::Record;
use crate::table::TableDescriptor;

/// Movement of one cursor unit during a read.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitAdvance {
    /// Identity of the partition, `None` for a single-cursor table
    pub unit: Option<String>,
    pub from: CursorValue,
    pub from_inclusive: bool,
    pub to: CursorValue,
}

/// Result of one `read_batch` call.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<Record>,
    pub advances: Vec<UnitAdvance>,
    /// Statements executed; idle-gated units issue none
    pub queries: usize,
    /// Some unit returned a full batch, so more rows are likely waiting
    pub filled: bool,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Incremental reader of one registered table.
///
/// `read_batch` calls are serialized per table. Checkpoint flushes and partition
/// discovery may run alongside a read; both see the cursor through its lock, so
/// a flush never observes a half-updated partition map.
pub struct TableCursor {
    descriptor: TableDescriptor,
    schema: Arc<TableSchema>,
    builder: SelectionBuilder,
    executor: Arc<dyn Executor>,
    kind: CursorKind,
    identity_column: Option<ColumnInfo>,
    idle_policy: IdlePolicy,
    state: RwLock<Cursor>,
    poll_guard: Mutex<()>,
}

impl TableCursor {
    /// Build the cursor for a validated table and work out where reading starts.
    pub async fn open(
        descriptor: TableDescriptor,
        schema: Arc<TableSchema>,
        executor: Arc<dyn Executor>,
        positions: &PositionStore,
        idle_policy: IdlePolicy,
    ) -> Result<Self, TailError> {
        let name = descriptor.name().to_string();
        let builder = SelectionBuilder::new(
            &descriptor,
            &schema,
            executor.dialect(),
            executor.table_ref(&name),
        )?;

        let cursor_config = descriptor.cursor().clone();
        let kind = schema
            .column(&cursor_config.increment)
            .and_then(|c| CursorKind::of(c.kind))
            .ok_or_else(|| TailError::schema(&name, "increment column cannot drive a cursor"))?;
        let identity_column = match &cursor_config.identity {
            Some(identity) => Some(schema.column(identity).cloned().ok_or_else(|| {
                TailError::schema(&name, format!("identity column '{}' does not exist", identity))
            })?),
            None => None,
        };

        let parse = |text: &str, what: &str| {
            CursorValue::parse(kind, text).map_err(|e| {
                TailError::Config(format!("table '{}': invalid {}: {}", name, what, e))
            })
        };
        let configured = cursor_config
            .default_start
            .as_deref()
            .map(|s| parse(s, "default_start"))
            .transpose()?;

        let persisted = match positions.load(
            executor.catalog(),
            &name,
            kind,
            identity_column.is_some(),
        ) {
            Ok(snapshot) => snapshot,
            Err(e @ TailError::CorruptCheckpoint { .. }) => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable checkpoint for '{}', starting from configuration: {:?}",
                    name,
                    e
                );
                None
            }
        };

        let state = match &identity_column {
            None => {
                let persisted = match persisted.map(|c| c.snapshot) {
                    Some(CursorSnapshot::Single(value)) => Some(value),
                    _ => None,
                };
                let value = reconcile_single(configured, persisted, kind);
                tracing::info!("Table '{}' starts after {}", name, value);
                Cursor::Single { value, idle: None }
            }
            Some(identity_column) => {
                let mut starts = BTreeMap::new();
                for (identity, text) in &cursor_config.starts {
                    starts.insert(
                        identity.clone(),
                        parse(text, &format!("start for identity '{}'", identity))?,
                    );
                }
                let (persisted, unread) = match persisted {
                    Some(Checkpoint {
                        snapshot: CursorSnapshot::Partitioned(map),
                        inclusive,
                    }) => (map, inclusive),
                    _ => (BTreeMap::new(), BTreeSet::new()),
                };

                // Identities present in the database, with their bindable values
                let mut known: BTreeMap<String, SqlValue> = BTreeMap::new();
                if let Some((sql, params)) = builder.partition_minimums(
                    &identity_params(identity_column, &cursor_config.includes),
                    &identity_params(identity_column, &cursor_config.excludes),
                ) {
                    for row in executor.query(&sql, &params).await? {
                        if let Some(value) = row.get(IDENTITY_LABEL).filter(|v| !v.is_null()) {
                            if let Some(key) = value.to_text() {
                                known.insert(key, value.clone());
                            }
                        }
                    }
                }
                for identity in starts
                    .keys()
                    .chain(persisted.keys())
                    .chain(cursor_config.includes.iter())
                {
                    if !known.contains_key(identity) {
                        known.insert(identity.clone(), identity_param(identity_column, identity));
                    }
                }

                let includes: BTreeSet<&str> =
                    cursor_config.includes.iter().map(String::as_str).collect();
                let excludes: BTreeSet<&str> =
                    cursor_config.excludes.iter().map(String::as_str).collect();

                let mut arena = PartitionArena::new();
                for (identity, param) in known {
                    if (!includes.is_empty() && !includes.contains(identity.as_str()))
                        || excludes.contains(identity.as_str())
                    {
                        continue;
                    }
                    let after = reconcile_partition(
                        configured.as_ref(),
                        starts.get(&identity),
                        persisted.get(&identity),
                        kind,
                    );
                    // a persisted unread start stays inclusive unless configuration moved past it
                    let inclusive =
                        unread.contains(&identity) && persisted.get(&identity) == Some(&after);
                    let slot = PartitionSlot::new(identity, param, after);
                    arena.insert(if inclusive { slot.inclusive() } else { slot });
                }
                tracing::info!(
                    "Table '{}' tracks {} partitions by '{}'",
                    name,
                    arena.len(),
                    identity_column.name
                );
                Cursor::Partitioned(arena)
            }
        };

        Ok(Self {
            descriptor,
            schema,
            builder,
            executor,
            kind,
            identity_column,
            idle_policy,
            state: RwLock::new(state),
            poll_guard: Mutex::new(()),
        })
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn alias(&self) -> &str {
        self.descriptor.alias()
    }

    /// Catalog the table lives in; checkpoints are grouped by it.
    pub fn catalog(&self) -> &str {
        self.executor.catalog()
    }

    pub fn kind(&self) -> CursorKind {
        self.kind
    }

    pub fn is_partitioned(&self) -> bool {
        self.identity_column.is_some()
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        self.idle_policy
    }

    /// Consistent copy of the current positions.
    pub async fn snapshot(&self) -> CursorSnapshot {
        self.state.read().await.snapshot()
    }

    /// Positions plus unread inclusive starts, as written to the checkpoint file.
    pub async fn checkpoint(&self) -> Checkpoint {
        self.state.read().await.checkpoint()
    }

    /// Consecutive empty polls of a unit (`None` selects the single cursor); 0 when active.
    pub async fn idle_count(&self, identity: Option<&str>) -> u32 {
        let state = self.state.read().await;
        let idle = match (&*state, identity) {
            (Cursor::Single { idle, .. }, None) => *idle,
            (Cursor::Partitioned(arena), Some(identity)) => {
                arena.get(identity).and_then(|slot| slot.idle)
            }
            _ => None,
        };
        idle.map_or(0, |i| i.count())
    }

    /// Read the next rows after the current cursor position(s).
    pub async fn read_batch(&self, max_rows: usize) -> Result<Batch, TailError> {
        self.read_batch_at(max_rows, Instant::now()).await
    }

    /// `read_batch` with an explicit clock, for driving the idle gate.
    pub async fn read_batch_at(&self, max_rows: usize, now: Instant) -> Result<Batch, TailError> {
        let _guard = self.poll_guard.lock().await;
        let max_rows = max_rows.max(1);
        if self.is_partitioned() {
            self.read_partitions(max_rows, now).await
        } else {
            self.read_single(max_rows, now).await
        }
    }

    async fn read_single(&self, max_rows: usize, now: Instant) -> Result<Batch, TailError> {
        let (after, idle) = match &*self.state.read().await {
            Cursor::Single { value, idle } => (value.clone(), *idle),
            Cursor::Partitioned(_) => return Ok(Batch::default()),
        };
        if let Some(idle) = idle {
            if !idle.permits(now, &self.idle_policy) {
                tracing::trace!("Table '{}' is idle, skipping poll", self.name());
                return Ok(Batch::default());
            }
        }

        let mut batch = Batch {
            queries: 1,
            ..Batch::default()
        };
        let (sql, params) = self.builder.single_scan(after.to_sql_value(), max_rows);
        let rows = match self.executor.query(&sql, &params).await {
            Ok(rows) => rows,
            Err(source) => return Err(self.extraction(batch, source)),
        };
        let last = match rows.last() {
            Some(row) => match self.increment_of(row) {
                Ok(value) => Some(value),
                Err(source) => return Err(self.extraction(batch, source)),
            },
            None => None,
        };

        let mut state = self.state.write().await;
        if let Cursor::Single { value, idle } = &mut *state {
            match last {
                Some(last) => {
                    tracing::debug!(
                        "Table '{}' read {} rows, cursor {} -> {}",
                        self.name(),
                        rows.len(),
                        after,
                        last
                    );
                    *value = last.clone();
                    *idle = None;
                    batch.advances.push(UnitAdvance {
                        unit: None,
                        from: after,
                        from_inclusive: false,
                        to: last,
                    });
                }
                None => {
                    *idle = after_poll(*idle, 0, now);
                }
            }
        }
        drop(state);

        batch.filled = rows.len() >= max_rows;
        batch.records = self.to_records(&rows);
        Ok(batch)
    }

    async fn read_partitions(&self, max_rows: usize, now: Instant) -> Result<Batch, TailError> {
        let mut batch = Batch::default();
        let count = match &*self.state.read().await {
            Cursor::Partitioned(arena) => arena.len(),
            Cursor::Single { .. } => return Ok(batch),
        };

        for idx in 0..count {
            let slot = match &*self.state.read().await {
                Cursor::Partitioned(arena) => arena.slot(idx).cloned(),
                Cursor::Single { .. } => None,
            };
            let Some(slot) = slot else { continue };
            if let Some(idle) = slot.idle {
                if !idle.permits(now, &self.idle_policy) {
                    continue;
                }
            }

            let (sql, params) = self.builder.partition_scan(
                slot.param.clone(),
                slot.after.to_sql_value(),
                slot.inclusive,
                max_rows,
            );
            batch.queries += 1;
            let rows = match self.executor.query(&sql, &params).await {
                Ok(rows) => rows,
                Err(source) => return Err(self.extraction(batch, source)),
            };
            let last = match rows.last() {
                Some(row) => match self.increment_of(row) {
                    Ok(value) => Some(value),
                    Err(source) => return Err(self.extraction(batch, source)),
                },
                None => None,
            };

            let mut state = self.state.write().await;
            if let Cursor::Partitioned(arena) = &mut *state {
                if let Some(current) = arena.slot_mut(idx) {
                    match last {
                        Some(last) => {
                            tracing::debug!(
                                "Table '{}' partition '{}' read {} rows, cursor {} -> {}",
                                self.name(),
                                slot.identity,
                                rows.len(),
                                slot.after,
                                last
                            );
                            current.after = last.clone();
                            current.inclusive = false;
                            current.idle = None;
                            batch.advances.push(UnitAdvance {
                                unit: Some(slot.identity.clone()),
                                from: slot.after.clone(),
                                from_inclusive: slot.inclusive,
                                to: last,
                            });
                        }
                        None => {
                            current.idle = after_poll(current.idle, 0, now);
                        }
                    }
                }
            }
            drop(state);

            if rows.len() >= max_rows {
                batch.filled = true;
            }
            batch.records.extend(self.to_records(&rows));
        }

        Ok(batch)
    }

    /// Add identities present in the database but not yet tracked.
    ///
    /// New identities start at their minimum increment value, read inclusively.
    /// The inclusive flag is part of the checkpoint, so a flush between discovery
    /// and the first read does not lose the minimum row across a restart.
    /// Tracked identities are never touched. Returns the number added.
    pub async fn discover_partitions(&self) -> Result<usize, TailError> {
        let cursor = self.descriptor.cursor();
        let Some(identity_column) = &self.identity_column else {
            return Ok(0);
        };
        if !cursor.discover {
            return Ok(0);
        }
        let Some((sql, params)) = self.builder.partition_minimums(
            &identity_params(identity_column, &cursor.includes),
            &identity_params(identity_column, &cursor.excludes),
        ) else {
            return Ok(0);
        };

        let rows = self.executor.query(&sql, &params).await?;

        let mut added = 0;
        let mut state = self.state.write().await;
        if let Cursor::Partitioned(arena) = &mut *state {
            for row in &rows {
                let Some(param) = row.get(IDENTITY_LABEL).filter(|v| !v.is_null()) else {
                    continue;
                };
                let Some(identity) = param.to_text() else {
                    continue;
                };
                if arena.contains(&identity) {
                    continue;
                }
                let Some(minimum) = row
                    .get(MINIMUM_LABEL)
                    .and_then(|v| CursorValue::from_sql(self.kind, v))
                else {
                    tracing::warn!(
                        "Table '{}': cannot read minimum of partition '{}', skipping",
                        self.name(),
                        identity
                    );
                    continue;
                };
                tracing::info!(
                    "Table '{}': discovered partition '{}' starting at {}",
                    self.name(),
                    identity,
                    minimum
                );
                arena.insert(PartitionSlot::new(identity, param.clone(), minimum).inclusive());
                added += 1;
            }
        }
        Ok(added)
    }

    /// Undo the advances of a batch that could not be delivered.
    ///
    /// A unit is reverted only while it still holds the value the batch moved it to.
    pub async fn rollback(&self, batch: &Batch) {
        let _guard = self.poll_guard.lock().await;
        let mut state = self.state.write().await;
        for advance in batch.advances.iter().rev() {
            match (&mut *state, &advance.unit) {
                (Cursor::Single { value, .. }, None) => {
                    if *value == advance.to {
                        *value = advance.from.clone();
                    }
                }
                (Cursor::Partitioned(arena), Some(identity)) => {
                    if let Some(slot) = arena.get_mut(identity) {
                        if slot.after == advance.to {
                            slot.after = advance.from.clone();
                            slot.inclusive = advance.from_inclusive;
                        }
                    }
                }
                _ => {}
            }
        }
        tracing::warn!(
            "Table '{}': rolled back {} cursor advances",
            self.name(),
            batch.advances.len()
        );
    }

    fn increment_of(&self, row: &SqlRow) -> Result<CursorValue, DbError> {
        let label = self.descriptor.alias_of(&self.descriptor.cursor().increment);
        row.get(label)
            .and_then(|value| CursorValue::from_sql(self.kind, value))
            .ok_or_else(|| {
                DbError::Conversion(format!(
                    "table '{}': cannot read increment column '{}' from row",
                    self.name(),
                    label
                ))
            })
    }

    fn to_records(&self, rows: &[SqlRow]) -> Vec<Record> {
        rows.iter()
            .map(|row| Record::from_row(row, self.alias()))
            .collect()
    }

    fn extraction(&self, partial: Batch, source: DbError) -> TailError {
        TailError::Extraction {
            table: self.name().to_string(),
            partial: Box::new(partial),
            source,
        }
    }
}

/// Bindable value of a configured identity, typed after the identity column.
fn identity_param(column: &ColumnInfo, text: &str) -> SqlValue {
    match column.kind {
        ColumnKind::Integer => text
            .trim()
            .parse::<i64>()
            .map(SqlValue::Integer)
            .unwrap_or_else(|_| SqlValue::Text(text.to_string())),
        ColumnKind::Decimal => Decimal::from_str(text.trim())
            .map(SqlValue::Decimal)
            .unwrap_or_else(|_| SqlValue::Text(text.to_string())),
        _ => SqlValue::Text(text.to_string()),
    }
}

fn identity_params(column: &ColumnInfo, identities: &[String]) -> Vec<SqlValue> {
    identities
        .iter()
        .map(|identity| identity_param(column, identity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaCatalog;
    use crate::config::TableConfig;
    use crate::db::SqliteExecutor;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        writer: rusqlite::Connection,
        executor: Arc<dyn Executor>,
        positions: PositionStore,
    }

    fn fixture(ddl: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("source.db");
        let writer = rusqlite::Connection::open(&db).unwrap();
        writer.execute_batch(ddl).unwrap();
        let executor: Arc<dyn Executor> = Arc::new(SqliteExecutor::open(&db).unwrap());
        let positions = PositionStore::new(dir.path().join("positions"));
        Fixture {
            _dir: dir,
            writer,
            executor,
            positions,
        }
    }

    async fn open(fx: &Fixture, table: &str) -> TableCursor {
        let config: TableConfig = toml::from_str(table).unwrap();
        let descriptor = TableDescriptor::from_config(&config).unwrap();
        let mut catalog = SchemaCatalog::new(fx.executor.clone());
        let schema = catalog.resolve(&descriptor).await.unwrap();
        TableCursor::open(
            descriptor,
            schema,
            fx.executor.clone(),
            &fx.positions,
            IdlePolicy::new(Duration::from_secs(60), Duration::from_secs(3600)),
        )
        .await
        .unwrap()
    }

    const EVENTS: &str = "CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT);
         INSERT INTO events VALUES (1, 'a'), (2, 'b'), (3, 'c');";

    #[tokio::test]
    async fn test_single_read_advances_and_goes_idle() {
        let fx = fixture(EVENTS);
        let cursor = open(
            &fx,
            r#"
            name = "events"
            [cursor]
            increment = "id"
            "#,
        )
        .await;

        let batch = cursor.read_batch(10).await.unwrap();
        assert_eq!(batch.records.len(), 3);
        assert!(!batch.filled);
        assert_eq!(
            cursor.snapshot().await,
            CursorSnapshot::Single(CursorValue::Integer(3))
        );

        let t0 = Instant::now();
        let empty = cursor.read_batch_at(10, t0).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.queries, 1);
        assert_eq!(cursor.idle_count(None).await, 1);

        // gated: no query issued, count unchanged
        let gated = cursor
            .read_batch_at(10, t0 + Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(gated.queries, 0);
        assert_eq!(cursor.idle_count(None).await, 1);

        fx.writer
            .execute("INSERT INTO events VALUES (4, 'd')", [])
            .unwrap();
        let batch = cursor
            .read_batch_at(10, t0 + Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].body["kind"], "d");
        assert_eq!(cursor.idle_count(None).await, 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_position() {
        let fx = fixture(EVENTS);
        let cursor = open(
            &fx,
            r#"
            name = "events"
            [cursor]
            increment = "id"
            "#,
        )
        .await;

        let batch = cursor.read_batch(2).await.unwrap();
        assert!(batch.filled);
        assert_eq!(
            batch.advances,
            vec![UnitAdvance {
                unit: None,
                from: CursorValue::Integer(0),
                from_inclusive: false,
                to: CursorValue::Integer(2),
            }]
        );
        cursor.rollback(&batch).await;
        assert_eq!(
            cursor.snapshot().await,
            CursorSnapshot::Single(CursorValue::Integer(0))
        );
        assert_eq!(cursor.read_batch(2).await.unwrap().records.len(), 2);
    }

    #[tokio::test]
    async fn test_extraction_error_is_retryable() {
        let fx = fixture(EVENTS);
        let cursor = open(
            &fx,
            r#"
            name = "events"
            [cursor]
            increment = "id"
            "#,
        )
        .await;
        fx.writer.execute_batch("DROP TABLE events;").unwrap();

        let err = cursor.read_batch(10).await.unwrap_err();
        assert!(err.is_retryable());
        match err {
            TailError::Extraction { partial, .. } => assert!(partial.is_empty()),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            cursor.snapshot().await,
            CursorSnapshot::Single(CursorValue::Integer(0))
        );
    }

    #[test]
    fn test_identity_param_typing() {
        let int_col = ColumnInfo::new("device_id", "INTEGER");
        let text_col = ColumnInfo::new("device", "TEXT");
        assert_eq!(identity_param(&int_col, "7"), SqlValue::Integer(7));
        assert_eq!(identity_param(&int_col, "x"), SqlValue::Text("x".into()));
        assert_eq!(identity_param(&text_col, "7"), SqlValue::Text("7".into()));
    }
}
