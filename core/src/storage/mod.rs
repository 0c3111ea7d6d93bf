//! Record storage
//!
//! The core only needs `put`, `get` and `list_by_filter` from a store. The
//! in-memory implementation here is an append-only log: every new record
//! gets the next local sequence number and is never removed. Causal
//! parents are stored as record ids and resolved through the store.

pub mod memory;

pub use memory::MemoryStore;

use crate::record::MemoryRecord;
use crate::types::RecordId;
use crate::{Error, Result};
use std::collections::{BTreeSet, VecDeque};

/// Result of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// First time this id was stored
    Inserted { seq: u64 },
    /// Merged into an existing record; `changed` is false for pure duplicates
    Merged { changed: bool },
}

impl PutOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, PutOutcome::Inserted { .. })
    }

    pub fn changed(&self) -> bool {
        match self {
            PutOutcome::Inserted { .. } => true,
            PutOutcome::Merged { changed } => *changed,
        }
    }
}

/// Storage backend owned by one instance
pub trait RecordStore: Send {
    /// Insert a record, merging metadata if the id is already present
    fn put(&mut self, record: MemoryRecord) -> Result<PutOutcome>;

    fn get(&self, id: &RecordId) -> Result<Option<MemoryRecord>>;

    fn list_by_filter(&self, predicate: &dyn Fn(&MemoryRecord) -> bool) -> Result<Vec<MemoryRecord>>;

    /// All stored ids in ascending order
    fn ids(&self) -> Result<BTreeSet<RecordId>>;

    fn contains(&self, id: &RecordId) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transitive causal parents of `id`, nearest first
///
/// Walks parent pointers iteratively with a visited set, so malformed
/// cyclic references terminate. Parents missing from the store are skipped.
pub fn ancestors(store: &dyn RecordStore, id: &RecordId) -> Result<Vec<RecordId>> {
    let start = store.get(id)?.ok_or(Error::NotFound(*id))?;

    let mut visited = BTreeSet::from([*id]);
    let mut queue: VecDeque<RecordId> = start.meta.causal_parents.iter().copied().collect();
    let mut out = Vec::new();

    while let Some(next) = queue.pop_front() {
        if !visited.insert(next) {
            continue;
        }
        let Some(record) = store.get(&next)? else {
            continue;
        };
        out.push(next);
        queue.extend(record.meta.causal_parents.iter().copied());
    }

    Ok(out)
}
