// ABOUTME: TOML configuration for the tailer: source connection, poller settings, tables
// ABOUTME: Applies defaults and validates table definitions before anything connects

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TailError;
use crate::utils::validate_identifier;

/// Complete configuration file.
///
/// ```toml
/// [source]
/// url = "postgresql://tailer@localhost/metrics"
///
/// [poller]
/// batch_size = 500
///
/// [[tables]]
/// name = "device_readings"
/// alias = "readings"
///
/// [tables.cursor]
/// identity = "device_id"
/// increment = "recorded_at"
/// default_start = "2024-01-01"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TailerConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub poller: PollerSettings,
    /// Tables (real names or aliases) lookups may resolve. Defaults to every
    /// configured table.
    #[serde(default)]
    pub allowed_tables: Option<Vec<String>>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl TailerConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: TailerConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-table constraints and normalize poller settings.
    pub fn validate(&mut self) -> Result<()> {
        self.poller.validate()?;

        let mut aliases = BTreeSet::new();
        for table in &self.tables {
            table.validate()?;
            if !aliases.insert(table.alias()) {
                anyhow::bail!(
                    "Alias '{}' is used by more than one table",
                    table.alias()
                );
            }
        }
        Ok(())
    }

    /// Names and aliases lookups are allowed to resolve. Empty means unrestricted.
    pub fn allow_list(&self) -> BTreeSet<String> {
        match &self.allowed_tables {
            Some(explicit) => explicit.iter().cloned().collect(),
            None => self
                .tables
                .iter()
                .flat_map(|t| [t.name.clone(), t.alias().to_string()])
                .collect(),
        }
    }
}

/// Where rows are read from.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// `postgres://…`, `postgresql://…` or `sqlite://<path>`
    pub url: String,
    /// PostgreSQL schema holding the tables
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub allow_self_signed_certs: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            schema: default_schema(),
            pool_size: default_pool_size(),
            allow_self_signed_certs: false,
        }
    }
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_pool_size() -> usize {
    4
}

/// Poll loop, backoff and checkpoint settings shared by every table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollerSettings {
    /// Maximum rows per cursor unit per read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between passes when no table filled its batch.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_discover_interval_ms")]
    pub discover_interval_ms: u64,
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_idle_max_ms")]
    pub idle_max_ms: u64,
    /// Root directory for checkpoint files (default `~/.database-tailer`)
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Number of tables polled concurrently within one pass.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Retries when the record sink rejects a batch.
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: u32,
}

impl PollerSettings {
    pub const DEFAULT_BATCH_SIZE: usize = 100;
    pub const MIN_FLUSH_INTERVAL_MS: u64 = 3_000;
    pub const MIN_DISCOVER_INTERVAL_MS: u64 = 300_000;

    /// Reject impossible values and clamp the background intervals to their floors.
    pub fn validate(&mut self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("poller.batch_size must be greater than 0");
        }
        if self.parallelism == 0 {
            anyhow::bail!("poller.parallelism must be greater than 0");
        }
        if self.flush_interval_ms < Self::MIN_FLUSH_INTERVAL_MS {
            tracing::warn!(
                "poller.flush_interval_ms={} is below the minimum, using {}",
                self.flush_interval_ms,
                Self::MIN_FLUSH_INTERVAL_MS
            );
            self.flush_interval_ms = Self::MIN_FLUSH_INTERVAL_MS;
        }
        if self.discover_interval_ms < Self::MIN_DISCOVER_INTERVAL_MS {
            tracing::warn!(
                "poller.discover_interval_ms={} is below the minimum, using {}",
                self.discover_interval_ms,
                Self::MIN_DISCOVER_INTERVAL_MS
            );
            self.discover_interval_ms = Self::MIN_DISCOVER_INTERVAL_MS;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn discover_interval(&self) -> Duration {
        Duration::from_millis(self.discover_interval_ms)
    }

    pub fn checkpoint_root(&self) -> PathBuf {
        match &self.checkpoint_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".database-tailer"),
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            discover_interval_ms: default_discover_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            idle_max_ms: default_idle_max_ms(),
            checkpoint_dir: None,
            parallelism: default_parallelism(),
            delivery_retries: default_delivery_retries(),
        }
    }
}

fn default_batch_size() -> usize {
    PollerSettings::DEFAULT_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_flush_interval_ms() -> u64 {
    PollerSettings::MIN_FLUSH_INTERVAL_MS
}

fn default_discover_interval_ms() -> u64 {
    PollerSettings::MIN_DISCOVER_INTERVAL_MS
}

fn default_idle_interval_ms() -> u64 {
    60_000
}

fn default_idle_max_ms() -> u64 {
    3_600_000
}

fn default_parallelism() -> usize {
    1
}

fn default_delivery_retries() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// One tracked table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    /// Real table name, used in queries
    pub name: String,
    /// External name carried on records (defaults to `name`)
    #[serde(default)]
    pub alias: Option<String>,
    /// Accessible columns; empty means every column
    #[serde(default)]
    pub columns: Vec<String>,
    /// Column renames, real name -> alias
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Read-time SQL expression per column, real name -> expression
    #[serde(default)]
    pub convert: BTreeMap<String, String>,
    /// Static predicate ANDed into every scan
    #[serde(default, rename = "where")]
    pub filter: Option<String>,
    #[serde(default)]
    pub idle_interval_ms: Option<u64>,
    #[serde(default)]
    pub idle_max_ms: Option<u64>,
    pub cursor: CursorConfig,
}

/// Cursor column(s) and start overrides for a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CursorConfig {
    /// Monotonically increasing column
    pub increment: String,
    /// Partitioning column; set for per-identity cursors
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub default_start: Option<String>,
    /// Per-identity start values
    #[serde(default)]
    pub starts: BTreeMap<String, String>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default = "default_true")]
    pub discover: bool,
}

impl CursorConfig {
    pub fn is_partitioned(&self) -> bool {
        self.identity.is_some()
    }
}

impl TableConfig {
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Idle interval and cap for this table, falling back to the poller defaults.
    pub fn idle_policy(&self, settings: &PollerSettings) -> crate::cursor::IdlePolicy {
        crate::cursor::IdlePolicy::new(
            Duration::from_millis(self.idle_interval_ms.unwrap_or(settings.idle_interval_ms)),
            Duration::from_millis(self.idle_max_ms.unwrap_or(settings.idle_max_ms)),
        )
    }

    /// Structural checks that need no database.
    pub fn validate(&self) -> Result<(), TailError> {
        let invalid = |message: String| TailError::Config(format!("table '{}': {}", self.name, message));

        validate_identifier(&self.name).map_err(|e| invalid(e.to_string()))?;
        validate_identifier(&self.cursor.increment).map_err(|e| invalid(e.to_string()))?;
        if let Some(identity) = &self.cursor.identity {
            validate_identifier(identity).map_err(|e| invalid(e.to_string()))?;
            if identity == &self.cursor.increment {
                return Err(invalid(
                    "identity and increment must be different columns".to_string(),
                ));
            }
        }
        for column in self.columns.iter().chain(self.rename.keys()).chain(self.convert.keys()) {
            validate_identifier(column).map_err(|e| invalid(e.to_string()))?;
        }
        if self.alias().trim().is_empty() {
            return Err(invalid("alias cannot be empty".to_string()));
        }

        let mut targets = BTreeSet::new();
        for (real, alias) in &self.rename {
            if alias.trim().is_empty() {
                return Err(invalid(format!("rename of '{}' cannot be empty", real)));
            }
            if !targets.insert(alias.as_str()) {
                return Err(invalid(format!(
                    "rename target '{}' is used for more than one column",
                    alias
                )));
            }
        }
        // A rename must not collide with another column that keeps its own name
        for alias in &targets {
            if !self.rename.contains_key(*alias)
                && (self.columns.iter().any(|c| c.as_str() == *alias)
                    || self.cursor_columns().any(|c| c == *alias))
            {
                return Err(invalid(format!(
                    "rename target '{}' collides with an existing column",
                    alias
                )));
            }
        }

        for column in self.cursor_columns() {
            if self.convert.contains_key(column) {
                return Err(invalid(format!(
                    "cursor column '{}' cannot have a read-time conversion",
                    column
                )));
            }
        }

        if !self.cursor.is_partitioned()
            && (!self.cursor.starts.is_empty()
                || !self.cursor.includes.is_empty()
                || !self.cursor.excludes.is_empty())
        {
            return Err(invalid(
                "starts, includes and excludes require an identity column".to_string(),
            ));
        }

        if let (Some(interval), Some(max)) = (self.idle_interval_ms, self.idle_max_ms) {
            if max < interval {
                tracing::warn!(
                    "table '{}': idle_max_ms={} is below idle_interval_ms={}, backoff will never grow",
                    self.name,
                    max,
                    interval
                );
            }
        }

        Ok(())
    }

    /// Increment column, then identity column when partitioned.
    pub fn cursor_columns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.cursor.increment.as_str()).chain(self.cursor.identity.as_deref())
    }
}
