//! Observed-remove set

use crate::crdt::Merger;
use crate::types::InstanceId;
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unique tag for one add operation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct Tag {
    #[n(0)]
    pub instance: InstanceId,
    /// Lamport time of the add; unique per instance
    #[n(1)]
    pub seq: u64,
}

impl Tag {
    pub fn new(instance: InstanceId, seq: u64) -> Self {
        Self { instance, seq }
    }
}

/// Set where an element is present iff it has an add-tag that no remove observed
///
/// Both the add map and the tombstones only grow, so merge is a plain union.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct OrSet<T: Ord> {
    #[n(0)]
    adds: BTreeMap<T, BTreeSet<Tag>>,
    #[n(1)]
    removed: BTreeSet<Tag>,
}

impl<T: Ord> Default for OrSet<T> {
    fn default() -> Self {
        Self {
            adds: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: T, tag: Tag) {
        self.adds.entry(element).or_default().insert(tag);
    }

    /// Remove every add-tag observed so far for `element`
    ///
    /// Returns false if the element was not present. A concurrent add with
    /// an unseen tag survives the remove.
    pub fn remove(&mut self, element: &T) -> bool {
        let Some(tags) = self.adds.get(element) else {
            return false;
        };
        let live: Vec<Tag> = tags.difference(&self.removed).cloned().collect();
        if live.is_empty() {
            return false;
        }
        self.removed.extend(live);
        true
    }

    pub fn contains(&self, element: &T) -> bool {
        self.adds
            .get(element)
            .map(|tags| tags.iter().any(|t| !self.removed.contains(t)))
            .unwrap_or(false)
    }

    /// Present elements in order
    pub fn elements(&self) -> Vec<T> {
        self.adds
            .iter()
            .filter(|(_, tags)| tags.iter().any(|t| !self.removed.contains(t)))
            .map(|(e, _)| e.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Ord + Clone> Merger for OrSet<T> {
    fn merge(&self, other: &Self) -> Self {
        let mut adds = self.adds.clone();
        for (element, tags) in &other.adds {
            adds.entry(element.clone()).or_default().extend(tags.iter().cloned());
        }
        Self {
            adds,
            removed: self.removed.union(&other.removed).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(instance: &str, seq: u64) -> Tag {
        Tag::new(InstanceId::new(instance), seq)
    }

    #[test]
    fn test_add_remove() {
        let mut set = OrSet::new();
        set.add("urgent".to_string(), tag("a", 1));
        assert!(set.contains(&"urgent".to_string()));

        assert!(set.remove(&"urgent".to_string()));
        assert!(!set.contains(&"urgent".to_string()));
        assert!(!set.remove(&"urgent".to_string()));
        assert!(set.is_empty());
    }

    #[test]
    fn test_concurrent_add_survives_remove() {
        let mut a = OrSet::new();
        a.add("x".to_string(), tag("a", 1));

        let mut b = a.clone();
        b.remove(&"x".to_string());

        // A re-adds concurrently with B's remove
        a.add("x".to_string(), tag("a", 2));

        let merged = a.merge(&b);
        assert!(merged.contains(&"x".to_string()));
        assert_eq!(merged, b.merge(&a));
    }

    #[test]
    fn test_remove_after_sync_wins() {
        let mut a = OrSet::new();
        a.add(7u64, tag("a", 1));
        let mut b = a.clone();
        b.remove(&7);

        let merged = a.merge(&b);
        assert!(!merged.contains(&7));
        assert_eq!(merged.merge(&merged), merged);
    }
}
