// ABOUTME: Durable per-table checkpoint files and start-value reconciliation
// ABOUTME: Writes go to a temp file in the same directory, then rename over the old one

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cursor::{Checkpoint, CursorKind, CursorSnapshot, CursorValue};
use crate::error::TailError;

/// Checkpoint files laid out as `<root>/<catalog>/<table>.pos`.
///
/// Single-cursor tables store the scalar as plain text. Partitioned tables
/// store a JSON object mapping identity to value; an identity whose value has
/// not been read yet is written as `{"from": value}`.
#[derive(Debug, Clone)]
pub struct PositionStore {
    root: PathBuf,
}

impl PositionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, catalog: &str, table: &str) -> PathBuf {
        self.root
            .join(path_component(catalog))
            .join(format!("{}.pos", path_component(table)))
    }

    /// Raw file contents, `None` when no checkpoint exists.
    pub fn load_raw(&self, catalog: &str, table: &str) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(self.path(catalog, table)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the checkpoint atomically: write and fsync a temp file next to
    /// the target, then rename it into place.
    pub fn save_raw(&self, catalog: &str, table: &str, contents: &str) -> std::io::Result<()> {
        let path = self.path(catalog, table);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Load and parse a checkpoint.
    ///
    /// A missing file is `Ok(None)`. An unreadable file is `Persistence`; the
    /// caller decides whether to fall back. A file that does not parse is
    /// `CorruptCheckpoint`.
    pub fn load(
        &self,
        catalog: &str,
        table: &str,
        kind: CursorKind,
        partitioned: bool,
    ) -> Result<Option<Checkpoint>, TailError> {
        let path = self.path(catalog, table);
        let contents = match self.load_raw(catalog, table) {
            Ok(Some(contents)) => contents,
            Ok(None) => return Ok(None),
            Err(source) => {
                return Err(TailError::Persistence {
                    table: table.to_string(),
                    path,
                    source,
                })
            }
        };

        let corrupt = |message: String| TailError::CorruptCheckpoint {
            table: table.to_string(),
            path: path.clone(),
            message,
        };

        if partitioned {
            let map: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
            let mut positions = BTreeMap::new();
            let mut inclusive = BTreeSet::new();
            for (identity, entry) in &map {
                let value = match entry.get(FROM_KEY) {
                    Some(value) => {
                        inclusive.insert(identity.clone());
                        value
                    }
                    None => entry,
                };
                let value = CursorValue::from_json(kind, value)
                    .map_err(|e| corrupt(format!("identity '{}': {}", identity, e)))?;
                positions.insert(identity.clone(), value);
            }
            Ok(Some(Checkpoint {
                snapshot: CursorSnapshot::Partitioned(positions),
                inclusive,
            }))
        } else {
            let text = contents.strip_suffix('\n').unwrap_or(&contents);
            let value = CursorValue::parse(kind, text).map_err(corrupt)?;
            Ok(Some(CursorSnapshot::Single(value).into()))
        }
    }

    pub fn save(
        &self,
        catalog: &str,
        table: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), TailError> {
        let contents = match &checkpoint.snapshot {
            CursorSnapshot::Single(value) => value.to_string(),
            CursorSnapshot::Partitioned(positions) => {
                let map: serde_json::Map<String, serde_json::Value> = positions
                    .iter()
                    .map(|(identity, value)| {
                        let entry = if checkpoint.inclusive.contains(identity) {
                            let mut wrapped = serde_json::Map::new();
                            wrapped.insert(FROM_KEY.to_string(), value.to_json());
                            serde_json::Value::Object(wrapped)
                        } else {
                            value.to_json()
                        };
                        (identity.clone(), entry)
                    })
                    .collect();
                serde_json::Value::Object(map).to_string()
            }
        };

        self.save_raw(catalog, table, &contents)
            .map_err(|source| TailError::Persistence {
                table: table.to_string(),
                path: self.path(catalog, table),
                source,
            })
    }
}

/// Key of a partition entry whose value is read inclusively.
const FROM_KEY: &str = "from";

/// Keep catalog and table names from escaping the checkpoint root.
fn path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

/// Effective start of a single-cursor table: the earlier of the configured
/// default and the persisted value, so nothing unread is skipped.
pub fn reconcile_single(
    configured: Option<CursorValue>,
    persisted: Option<CursorValue>,
    kind: CursorKind,
) -> CursorValue {
    match (configured, persisted) {
        (Some(configured), Some(persisted)) => configured.min(persisted),
        (Some(value), None) | (None, Some(value)) => value,
        (None, None) => CursorValue::zero(kind),
    }
}

/// Effective start of one identity: the most advanced of the configured
/// default, the configured per-identity start and the persisted value.
pub fn reconcile_partition(
    default_start: Option<&CursorValue>,
    identity_start: Option<&CursorValue>,
    persisted: Option<&CursorValue>,
    kind: CursorKind,
) -> CursorValue {
    [default_start, identity_start, persisted]
        .into_iter()
        .flatten()
        .max()
        .cloned()
        .unwrap_or_else(|| CursorValue::zero(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> CursorValue {
        CursorValue::Integer(i)
    }

    #[test]
    fn test_path_layout() {
        let store = PositionStore::new("/var/lib/tailer");
        assert_eq!(
            store.path("metrics", "orders"),
            PathBuf::from("/var/lib/tailer/metrics/orders.pos")
        );
        assert_eq!(
            store.path("../etc", "a/b"),
            PathBuf::from("/var/lib/tailer/.._etc/a_b.pos")
        );
        assert_eq!(
            store.path("..", "t"),
            PathBuf::from("/var/lib/tailer/_../t.pos")
        );
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());
        assert!(store
            .load("db", "orders", CursorKind::Integer, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_single_round_trip_is_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());
        store
            .save("db", "orders", &CursorSnapshot::Single(int(42)).into())
            .unwrap();
        assert_eq!(
            store.load_raw("db", "orders").unwrap().as_deref(),
            Some("42")
        );
        assert_eq!(
            store.load("db", "orders", CursorKind::Integer, false).unwrap(),
            Some(CursorSnapshot::Single(int(42)).into())
        );
    }

    #[test]
    fn test_partitioned_round_trip_including_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());

        store
            .save("db", "readings", &CursorSnapshot::Partitioned(BTreeMap::new()).into())
            .unwrap();
        assert_eq!(
            store.load_raw("db", "readings").unwrap().as_deref(),
            Some("{}")
        );

        let mut positions = BTreeMap::new();
        positions.insert("7".to_string(), int(100));
        positions.insert("8".to_string(), int(3));
        let checkpoint: Checkpoint = CursorSnapshot::Partitioned(positions).into();
        store.save("db", "readings", &checkpoint).unwrap();
        assert_eq!(
            store.load("db", "readings", CursorKind::Integer, true).unwrap(),
            Some(checkpoint)
        );
    }

    #[test]
    fn test_unread_partition_keeps_inclusive_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());

        let mut positions = BTreeMap::new();
        positions.insert("7".to_string(), int(100));
        positions.insert("9".to_string(), int(40));
        let checkpoint = Checkpoint {
            snapshot: CursorSnapshot::Partitioned(positions),
            inclusive: ["9".to_string()].into_iter().collect(),
        };
        store.save("db", "readings", &checkpoint).unwrap();

        let raw = store.load_raw("db", "readings").unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, serde_json::json!({"7": 100, "9": {"from": 40}}));
        assert_eq!(
            store.load("db", "readings", CursorKind::Integer, true).unwrap(),
            Some(checkpoint)
        );
    }

    #[test]
    fn test_corrupt_file_is_fatal_for_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());
        store.save_raw("db", "orders", "not-a-number").unwrap();
        let err = store
            .load("db", "orders", CursorKind::Integer, false)
            .unwrap_err();
        assert!(matches!(err, TailError::CorruptCheckpoint { .. }));

        store.save_raw("db", "readings", "[1, 2]").unwrap();
        let err = store
            .load("db", "readings", CursorKind::Integer, true)
            .unwrap_err();
        assert!(matches!(err, TailError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());
        for i in 0..3 {
            store
                .save("db", "orders", &CursorSnapshot::Single(int(i)).into())
                .unwrap();
        }
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("db"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("orders.pos")]);
    }

    #[test]
    fn test_reconcile_single_prefers_earlier() {
        let kind = CursorKind::Timestamp;
        let config = CursorValue::parse(kind, "2020-01-01").unwrap();
        let early = CursorValue::parse(kind, "2019-06-01").unwrap();
        let late = CursorValue::parse(kind, "2021-01-01").unwrap();

        assert_eq!(
            reconcile_single(Some(config.clone()), Some(early.clone()), kind),
            early
        );
        assert_eq!(
            reconcile_single(Some(config.clone()), Some(late.clone()), kind),
            config
        );
        assert_eq!(reconcile_single(None, Some(late.clone()), kind), late);
        assert_eq!(
            reconcile_single(None, None, kind),
            CursorValue::zero(kind)
        );
    }

    #[test]
    fn test_reconcile_partition_prefers_most_advanced() {
        let kind = CursorKind::Integer;
        assert_eq!(
            reconcile_partition(Some(&int(10)), Some(&int(5)), Some(&int(30)), kind),
            int(30)
        );
        assert_eq!(
            reconcile_partition(Some(&int(10)), Some(&int(50)), None, kind),
            int(50)
        );
        assert_eq!(reconcile_partition(None, None, None, kind), int(0));
        assert_eq!(
            reconcile_partition(None, None, None, CursorKind::Text),
            CursorValue::Text(String::new())
        );
    }
}
