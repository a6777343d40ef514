// ABOUTME: Cursor state of a table: one global boundary or one boundary per identity
// ABOUTME: Mode is chosen at registration and never changes afterwards

pub mod idle;
pub mod partition;
pub mod value;

use std::collections::{BTreeMap, BTreeSet};

pub use idle::{IdlePolicy, IdleState};
pub use partition::{PartitionArena, PartitionSlot};
pub use value::{CursorKind, CursorValue};

/// In-memory read position of a table.
#[derive(Debug, Clone)]
pub enum Cursor {
    /// One increment column, one boundary for the whole table.
    Single {
        value: CursorValue,
        idle: Option<IdleState>,
    },
    /// Identity column plus increment column, one boundary per identity.
    Partitioned(PartitionArena),
}

impl Cursor {
    pub fn snapshot(&self) -> CursorSnapshot {
        match self {
            Cursor::Single { value, .. } => CursorSnapshot::Single(value.clone()),
            Cursor::Partitioned(arena) => CursorSnapshot::Partitioned(arena.positions()),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        match self {
            Cursor::Single { .. } => self.snapshot().into(),
            Cursor::Partitioned(arena) => Checkpoint {
                snapshot: self.snapshot(),
                inclusive: arena.inclusive_identities(),
            },
        }
    }
}

/// Consistent copy of a cursor's positions, as written to a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorSnapshot {
    Single(CursorValue),
    Partitioned(BTreeMap<String, CursorValue>),
}

/// Contents of a checkpoint file.
///
/// `inclusive` names identities whose stored value has not been read yet, such
/// as a discovered minimum, so a restart reads `>=` that value for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub snapshot: CursorSnapshot,
    pub inclusive: BTreeSet<String>,
}

impl From<CursorSnapshot> for Checkpoint {
    fn from(snapshot: CursorSnapshot) -> Self {
        Self {
            snapshot,
            inclusive: BTreeSet::new(),
        }
    }
}
