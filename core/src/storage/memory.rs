//! In-memory append-only record store

use crate::record::MemoryRecord;
use crate::storage::{PutOutcome, RecordStore};
use crate::types::RecordId;
use crate::Result;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct StoredRecord {
    seq: u64,
    record: MemoryRecord,
}

/// Append-only store with monotonically increasing local sequence numbers
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<RecordId, StoredRecord>,
    /// Ids in insertion order; index is the sequence number
    log: Vec<RecordId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local sequence number assigned when `id` was first stored
    pub fn sequence_of(&self, id: &RecordId) -> Option<u64> {
        self.records.get(id).map(|s| s.seq)
    }

    /// Ids stored after `seq`, in insertion order
    pub fn since(&self, seq: u64) -> &[RecordId] {
        let start = (seq as usize).min(self.log.len());
        &self.log[start..]
    }

    pub fn next_seq(&self) -> u64 {
        self.log.len() as u64
    }
}

impl RecordStore for MemoryStore {
    fn put(&mut self, record: MemoryRecord) -> Result<PutOutcome> {
        let id = record.id();
        match self.records.get_mut(&id) {
            Some(stored) => {
                let merged = stored.record.merge(&record)?;
                let changed = merged != stored.record;
                if changed {
                    stored.record = merged;
                }
                Ok(PutOutcome::Merged { changed })
            }
            None => {
                let seq = self.next_seq();
                self.log.push(id);
                self.records.insert(id, StoredRecord { seq, record });
                tracing::debug!(record_id = %id, seq, "Stored new record");
                Ok(PutOutcome::Inserted { seq })
            }
        }
    }

    fn get(&self, id: &RecordId) -> Result<Option<MemoryRecord>> {
        Ok(self.records.get(id).map(|s| s.record.clone()))
    }

    fn list_by_filter(&self, predicate: &dyn Fn(&MemoryRecord) -> bool) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .log
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|s| &s.record)
            .filter(|r| predicate(r))
            .cloned()
            .collect())
    }

    fn ids(&self) -> Result<BTreeSet<RecordId>> {
        Ok(self.records.keys().copied().collect())
    }

    fn contains(&self, id: &RecordId) -> Result<bool> {
        Ok(self.records.contains_key(id))
    }

    fn len(&self) -> usize {
        self.log.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalIdentity;
    use crate::record::CausalStamp;
    use crate::storage::ancestors;
    use crate::types::{InstanceId, MemoryType};
    use crate::Error;

    fn record(identity: &LocalIdentity, content: &str, parents: &[RecordId]) -> MemoryRecord {
        MemoryRecord::new_signed(
            identity,
            content,
            MemoryType::Thought,
            10,
            CausalStamp {
                causal_parents: parents.iter().copied().collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_append_only_sequence() {
        let me = LocalIdentity::generate(InstanceId::new("a"), 0);
        let mut store = MemoryStore::new();

        let r1 = record(&me, "one", &[]);
        let r2 = record(&me, "two", &[]);

        assert_eq!(store.put(r1.clone()).unwrap(), PutOutcome::Inserted { seq: 0 });
        assert_eq!(store.put(r2.clone()).unwrap(), PutOutcome::Inserted { seq: 1 });
        assert_eq!(store.put(r1.clone()).unwrap(), PutOutcome::Merged { changed: false });

        assert_eq!(store.len(), 2);
        assert_eq!(store.since(1), &[r2.id()]);
        assert_eq!(store.sequence_of(&r1.id()), Some(0));
    }

    #[test]
    fn test_put_merges_metadata() {
        let me = LocalIdentity::generate(InstanceId::new("a"), 0);
        let mut store = MemoryStore::new();
        let r = record(&me, "one", &[]);
        store.put(r.clone()).unwrap();

        let mut seen = r.clone();
        seen.meta.gossip.seen_by.insert(InstanceId::new("b"));
        assert_eq!(store.put(seen).unwrap(), PutOutcome::Merged { changed: true });

        let stored = store.get(&r.id()).unwrap().unwrap();
        assert!(stored.meta.gossip.seen_by.contains(&InstanceId::new("b")));
    }

    #[test]
    fn test_list_by_filter() {
        let me = LocalIdentity::generate(InstanceId::new("a"), 0);
        let mut store = MemoryStore::new();
        store.put(record(&me, "apple", &[])).unwrap();
        store.put(record(&me, "banana", &[])).unwrap();

        let found = store.list_by_filter(&|r| r.content().starts_with('b')).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content(), "banana");
    }

    #[test]
    fn test_ancestors_walk() {
        let me = LocalIdentity::generate(InstanceId::new("a"), 0);
        let mut store = MemoryStore::new();

        let root = record(&me, "root", &[]);
        let mid = record(&me, "mid", &[root.id()]);
        let missing = RecordId([0xEE; 48]);
        let leaf = record(&me, "leaf", &[mid.id(), root.id(), missing]);

        store.put(root.clone()).unwrap();
        store.put(mid.clone()).unwrap();
        store.put(leaf.clone()).unwrap();

        let found = ancestors(&store, &leaf.id()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&root.id()));
        assert!(found.contains(&mid.id()));

        assert!(ancestors(&store, &root.id()).unwrap().is_empty());
        assert!(matches!(ancestors(&store, &missing), Err(Error::NotFound(_))));
    }
}
