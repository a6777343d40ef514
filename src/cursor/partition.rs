// ABOUTME: Arena of per-identity cursor slots for partitioned tables
// ABOUTME: Dense slot vector addressed through a stable identity -> index map

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::idle::IdleState;
use super::value::CursorValue;
use crate::db::types::SqlValue;

/// Cursor state of one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSlot {
    /// Text form of the identity value, used as the checkpoint key
    pub identity: String,
    /// Identity value as bound into the scan
    pub param: SqlValue,
    /// Last increment value read for this identity
    pub after: CursorValue,
    /// Read `>= after` instead of `> after`. Set for identities whose start is a
    /// discovered minimum that has not been read yet.
    pub inclusive: bool,
    pub idle: Option<IdleState>,
}

impl PartitionSlot {
    pub fn new(identity: impl Into<String>, param: SqlValue, after: CursorValue) -> Self {
        Self {
            identity: identity.into(),
            param,
            after,
            inclusive: false,
            idle: None,
        }
    }

    pub fn inclusive(mut self) -> Self {
        self.inclusive = true;
        self
    }
}

/// Append-only collection of partition slots.
///
/// Slot indices never change once assigned, so a poll can walk `0..len()`
/// while discovery appends new identities behind it.
#[derive(Debug, Clone, Default)]
pub struct PartitionArena {
    index: HashMap<String, usize>,
    slots: Vec<PartitionSlot>,
}

impl PartitionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.index.contains_key(identity)
    }

    /// Add a slot unless its identity is already tracked. Returns whether it was added.
    pub fn insert(&mut self, slot: PartitionSlot) -> bool {
        if self.index.contains_key(&slot.identity) {
            return false;
        }
        self.index.insert(slot.identity.clone(), self.slots.len());
        self.slots.push(slot);
        true
    }

    pub fn get(&self, identity: &str) -> Option<&PartitionSlot> {
        self.index.get(identity).map(|&idx| &self.slots[idx])
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut PartitionSlot> {
        match self.index.get(identity) {
            Some(&idx) => self.slots.get_mut(idx),
            None => None,
        }
    }

    pub fn slot(&self, idx: usize) -> Option<&PartitionSlot> {
        self.slots.get(idx)
    }

    pub fn slot_mut(&mut self, idx: usize) -> Option<&mut PartitionSlot> {
        self.slots.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionSlot> {
        self.slots.iter()
    }

    /// Identity -> last value map, in identity order.
    pub fn positions(&self) -> BTreeMap<String, CursorValue> {
        self.slots
            .iter()
            .map(|s| (s.identity.clone(), s.after.clone()))
            .collect()
    }

    /// Identities still waiting to read their start value inclusively.
    pub fn inclusive_identities(&self) -> BTreeSet<String> {
        self.slots
            .iter()
            .filter(|s| s.inclusive)
            .map(|s| s.identity.clone())
            .collect()
    }
}
