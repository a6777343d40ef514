// ABOUTME: Registry of tracked tables sharing one executor, catalog and checkpoint store
// ABOUTME: Lookup by real name or alias, allow-list enforcement, checkpoint flush and discovery

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::catalog::SchemaCatalog;
use crate::config::{PollerSettings, TableConfig, TailerConfig};
use crate::db::Executor;
use crate::engine::TableCursor;
use crate::error::TailError;
use crate::position::PositionStore;
use crate::table::TableDescriptor;

/// Tables that failed to register, with the reason.
pub type RegistrationFailures = Vec<(String, TailError)>;

/// Set of registered tables keyed by real name, with an alias index.
pub struct TableRegistry {
    executor: Arc<dyn Executor>,
    catalog: SchemaCatalog,
    positions: PositionStore,
    settings: PollerSettings,
    allowed: BTreeSet<String>,
    tables: BTreeMap<String, Arc<TableCursor>>,
    aliases: HashMap<String, String>,
}

impl TableRegistry {
    pub fn new(
        executor: Arc<dyn Executor>,
        settings: PollerSettings,
        allowed: BTreeSet<String>,
    ) -> Self {
        let positions = PositionStore::new(settings.checkpoint_root());
        Self {
            catalog: SchemaCatalog::new(executor.clone()),
            executor,
            positions,
            settings,
            allowed,
            tables: BTreeMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Register every configured table.
    ///
    /// A table that fails (missing from the schema, corrupt checkpoint, …) is
    /// reported and skipped; the others are still registered.
    pub async fn open(
        executor: Arc<dyn Executor>,
        config: &TailerConfig,
    ) -> (Self, RegistrationFailures) {
        let mut registry = Self::new(executor, config.poller.clone(), config.allow_list());
        let mut failures = Vec::new();

        for table in &config.tables {
            match registry.register(table).await {
                Ok(cursor) => {
                    tracing::info!(
                        "Registered table '{}' as '{}'",
                        cursor.name(),
                        cursor.alias()
                    );
                }
                Err(e) => {
                    tracing::error!("Failed to register table '{}': {:?}", table.name, e);
                    failures.push((table.name.clone(), e));
                }
            }
        }

        (registry, failures)
    }

    /// Validate and open a table. Registering an alias twice returns the
    /// existing cursor.
    pub async fn register(&mut self, config: &TableConfig) -> Result<Arc<TableCursor>, TailError> {
        self.check_allowed(config.alias())?;
        self.check_allowed(&config.name)?;

        if let Some(existing) = self.lookup_alias(config.alias()) {
            return Ok(existing);
        }
        if self.tables.contains_key(&config.name) {
            return Err(TailError::Config(format!(
                "table '{}' is already registered under another alias",
                config.name
            )));
        }

        let descriptor = TableDescriptor::from_config(config)?;
        let schema = self.catalog.resolve(&descriptor).await?;
        let cursor = Arc::new(
            TableCursor::open(
                descriptor,
                schema,
                self.executor.clone(),
                &self.positions,
                config.idle_policy(&self.settings),
            )
            .await?,
        );

        self.aliases
            .insert(config.alias().to_string(), config.name.clone());
        self.tables.insert(config.name.clone(), cursor.clone());
        Ok(cursor)
    }

    pub fn by_alias(&self, alias: &str) -> Result<Option<Arc<TableCursor>>, TailError> {
        self.check_allowed(alias)?;
        Ok(self.lookup_alias(alias))
    }

    pub fn by_name(&self, name: &str) -> Result<Option<Arc<TableCursor>>, TailError> {
        self.check_allowed(name)?;
        Ok(self.tables.get(name).cloned())
    }

    /// All registered tables in name order.
    pub fn tables(&self) -> Vec<Arc<TableCursor>> {
        self.tables.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn positions(&self) -> &PositionStore {
        &self.positions
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// Write every table's current positions. Failures are logged and counted;
    /// losing a checkpoint only lengthens the replay after a restart.
    pub async fn flush_positions(&self) -> usize {
        let mut failed = 0;
        for table in self.tables.values() {
            let checkpoint = table.checkpoint().await;
            match self.positions.save(table.catalog(), table.name(), &checkpoint) {
                Ok(()) => tracing::trace!("Saved checkpoint for '{}'", table.name()),
                Err(e) => {
                    tracing::warn!("Failed to save checkpoint for '{}': {:?}", table.name(), e);
                    failed += 1;
                }
            }
        }
        tracing::debug!(
            "Flushed checkpoints for {} tables ({} failed)",
            self.tables.len(),
            failed
        );
        failed
    }

    /// Run partition discovery on every partitioned table. Returns the number of
    /// identities added.
    pub async fn discover_partitions(&self) -> usize {
        let mut added = 0;
        for table in self.tables.values().filter(|t| t.is_partitioned()) {
            match table.discover_partitions().await {
                Ok(n) => added += n,
                Err(e) => {
                    tracing::error!(
                        "Partition discovery failed for '{}': {:?}",
                        table.name(),
                        e
                    );
                }
            }
        }
        added
    }

    fn lookup_alias(&self, alias: &str) -> Option<Arc<TableCursor>> {
        self.aliases
            .get(alias)
            .and_then(|name| self.tables.get(name))
            .cloned()
    }

    fn check_allowed(&self, table: &str) -> Result<(), TailError> {
        if self.allowed.is_empty() || self.allowed.contains(table) {
            Ok(())
        } else {
            Err(TailError::AccessDenied(format!(
                "table '{}' is not in the allow-list",
                table
            )))
        }
    }
}
