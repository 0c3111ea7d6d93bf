//! Grow-only set of records

use crate::crdt::Merger;
use crate::record::MemoryRecord;
use crate::types::RecordId;
use std::collections::BTreeMap;

/// G-Set keyed by record id
///
/// Union on merge; when both sides hold the same id only the metadata is
/// merged, since content is bound to the id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: BTreeMap<RecordId, MemoryRecord>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or merge a record; returns whether the set changed
    pub fn insert(&mut self, record: MemoryRecord) -> bool {
        match self.records.get_mut(&record.id()) {
            Some(existing) => {
                let merged = existing.merge_same(&record);
                if merged == *existing {
                    false
                } else {
                    *existing = merged;
                    true
                }
            }
            None => {
                self.records.insert(record.id(), record);
                true
            }
        }
    }

    pub fn get(&self, id: &RecordId) -> Option<&MemoryRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.records.keys()
    }

    /// Records in id order
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRecord> {
        self.records.values()
    }

    pub fn into_records(self) -> Vec<MemoryRecord> {
        self.records.into_values().collect()
    }
}

impl FromIterator<MemoryRecord> for RecordSet {
    fn from_iter<I: IntoIterator<Item = MemoryRecord>>(iter: I) -> Self {
        let mut set = RecordSet::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

impl Merger for RecordSet {
    fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for record in other.records.values() {
            merged.insert(record.clone());
        }
        merged
    }
}
