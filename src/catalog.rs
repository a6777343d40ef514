// ABOUTME: Schema catalog: resolves tables against the live database once at registration
// ABOUTME: Validates configured columns and cursor columns, then serves cached lookups

use std::collections::HashMap;
use std::sync::Arc;

use crate::cursor::CursorKind;
use crate::db::{ColumnInfo, Executor};
use crate::error::TailError;
use crate::table::TableDescriptor;

/// Live column set of a validated table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Cache of validated table schemas.
///
/// Populated during registration; after startup it is only read.
pub struct SchemaCatalog {
    executor: Arc<dyn Executor>,
    tables: HashMap<String, Arc<TableSchema>>,
}

impl SchemaCatalog {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            tables: HashMap::new(),
        }
    }

    /// Cached schema of an already resolved table.
    pub fn get(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.get(table).cloned()
    }

    /// Load the live schema of `descriptor`'s table and check every column the
    /// configuration refers to.
    pub async fn resolve(
        &mut self,
        descriptor: &TableDescriptor,
    ) -> Result<Arc<TableSchema>, TailError> {
        let schema = match self.tables.get(descriptor.name()) {
            Some(cached) => cached.clone(),
            None => {
                let columns = self
                    .executor
                    .describe_table(descriptor.name())
                    .await?
                    .ok_or_else(|| {
                        TailError::schema(
                            descriptor.name(),
                            format!(
                                "table does not exist in catalog '{}'",
                                self.executor.catalog()
                            ),
                        )
                    })?;
                Arc::new(TableSchema {
                    table: descriptor.name().to_string(),
                    columns,
                })
            }
        };

        validate(descriptor, &schema)?;

        tracing::debug!(
            "Resolved table '{}' with {} columns",
            descriptor.name(),
            schema.columns.len()
        );
        self.tables
            .insert(descriptor.name().to_string(), schema.clone());
        Ok(schema)
    }
}

fn validate(descriptor: &TableDescriptor, schema: &TableSchema) -> Result<(), TailError> {
    let table = descriptor.name();
    let referenced = descriptor
        .columns()
        .iter()
        .chain(descriptor.renames().keys())
        .chain(descriptor.converts().keys());
    for column in referenced {
        if schema.column(column).is_none() {
            return Err(TailError::schema(
                table,
                format!("configured column '{}' does not exist", column),
            ));
        }
    }

    // renames and conversions only reach projected columns
    let cursor = descriptor.cursor();
    for column in descriptor.renames().keys().chain(descriptor.converts().keys()) {
        if column != &cursor.increment && cursor.identity.as_ref() != Some(column) {
            descriptor.check_column(column)?;
        }
    }

    let increment = schema.column(&cursor.increment).ok_or_else(|| {
        TailError::schema(
            table,
            format!("increment column '{}' does not exist", cursor.increment),
        )
    })?;
    if CursorKind::of(increment.kind).is_none() {
        return Err(TailError::schema(
            table,
            format!(
                "increment column '{}' has type '{}', which cannot be ordered as a cursor",
                increment.name, increment.data_type
            ),
        ));
    }

    if let Some(identity) = &cursor.identity {
        if schema.column(identity).is_none() {
            return Err(TailError::schema(
                table,
                format!("identity column '{}' does not exist", identity),
            ));
        }
    }

    Ok(())
}
