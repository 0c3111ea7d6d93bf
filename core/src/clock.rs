//! Logical clocks
//!
//! Lamport counters give a total order consistent with causality; vector
//! time captures the happened-before relation exactly, so concurrent edits
//! can be told apart from causally ordered ones.

use crate::{Error, Result};
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Largest counter accepted from a peer
///
/// Counters only grow by one per event, so anything near `u64::MAX` was
/// forged. Local arithmetic saturates regardless.
pub const MAX_REMOTE_COUNTER: u64 = u64::MAX / 2;

/// Reject a remote counter above `MAX_REMOTE_COUNTER`
pub fn check_remote(counter: u64) -> Result<u64> {
    if counter > MAX_REMOTE_COUNTER {
        return Err(Error::ImplausibleClock { counter });
    }
    Ok(counter)
}

/// Lamport logical clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event
    pub fn tick(&mut self) -> u64 {
        self.counter = self.counter.saturating_add(1);
        self.counter
    }

    /// Observe a remote counter: max(local, received) + 1
    pub fn merge(&mut self, received: u64) -> u64 {
        self.counter = self.counter.max(received).saturating_add(1);
        self.counter
    }

    pub fn current(&self) -> u64 {
        self.counter
    }
}

/// Vector timestamp indexed by instance ordinal
///
/// Missing trailing slots read as zero, so vectors from instances that know
/// fewer peers still compare correctly.
#[derive(Debug, Clone, Default, Encode, Decode, Serialize, Deserialize)]
#[cbor(transparent)]
#[serde(transparent)]
pub struct VectorTime(#[n(0)] pub Vec<u64>);

impl VectorTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> u64 {
        self.0.get(index).copied().unwrap_or(0)
    }

    fn set(&mut self, index: usize, value: u64) {
        if self.0.len() <= index {
            self.0.resize(index + 1, 0);
        }
        self.0[index] = value;
    }

    fn significant(&self) -> &[u64] {
        let end = self.0.iter().rposition(|&v| v != 0).map_or(0, |i| i + 1);
        &self.0[..end]
    }

    /// `self ≤ other` elementwise
    pub fn dominated_by(&self, other: &VectorTime) -> bool {
        let len = self.0.len().max(other.0.len());
        (0..len).all(|i| self.get(i) <= other.get(i))
    }

    /// True iff `self ≤ other` elementwise and `self ≠ other`
    pub fn happens_before(&self, other: &VectorTime) -> bool {
        self.dominated_by(other) && self != other
    }

    /// Neither happens before the other and they differ
    pub fn concurrent_with(&self, other: &VectorTime) -> bool {
        !self.dominated_by(other) && !other.dominated_by(self)
    }

    /// Reject vectors carrying any slot above `MAX_REMOTE_COUNTER`
    pub fn check_remote(&self) -> Result<()> {
        for &counter in &self.0 {
            check_remote(counter)?;
        }
        Ok(())
    }

    /// Elementwise maximum
    pub fn merge(&self, other: &VectorTime) -> VectorTime {
        let len = self.0.len().max(other.0.len());
        VectorTime((0..len).map(|i| self.get(i).max(other.get(i))).collect())
    }
}

impl PartialEq for VectorTime {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for VectorTime {}

impl Hash for VectorTime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl PartialOrd for VectorTime {
    /// Causal order; `None` for concurrent timestamps
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.dominated_by(other) {
            Some(Ordering::Less)
        } else if other.dominated_by(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl From<Vec<u64>> for VectorTime {
    fn from(v: Vec<u64>) -> Self {
        VectorTime(v)
    }
}

/// Vector clock owned by one instance
#[derive(Debug, Clone)]
pub struct VectorClock {
    index: usize,
    time: VectorTime,
}

impl VectorClock {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            time: VectorTime::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Increment the own slot
    pub fn tick(&mut self) -> VectorTime {
        let next = self.time.get(self.index).saturating_add(1);
        self.time.set(self.index, next);
        self.time.clone()
    }

    /// Elementwise max with a received vector, then increment the own slot
    pub fn merge(&mut self, received: &VectorTime) -> VectorTime {
        self.time = self.time.merge(received);
        self.tick()
    }

    /// Absorb a received vector without counting a local event
    pub fn observe(&mut self, received: &VectorTime) {
        self.time = self.time.merge(received);
    }

    pub fn current(&self) -> &VectorTime {
        &self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lamport_tick_and_merge() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.merge(10), 11);
        assert_eq!(clock.merge(3), 12);
        assert_eq!(clock.current(), 12);
    }

    #[test]
    fn test_counters_saturate() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.merge(u64::MAX), u64::MAX);
        assert_eq!(clock.tick(), u64::MAX);

        let mut vector = VectorClock::new(0);
        vector.observe(&VectorTime(vec![u64::MAX]));
        assert_eq!(vector.tick().get(0), u64::MAX);
    }

    #[test]
    fn test_remote_ceiling() {
        assert_eq!(check_remote(42).unwrap(), 42);
        assert_eq!(check_remote(MAX_REMOTE_COUNTER).unwrap(), MAX_REMOTE_COUNTER);
        assert!(matches!(
            check_remote(u64::MAX),
            Err(Error::ImplausibleClock { counter: u64::MAX })
        ));
        assert!(VectorTime(vec![3, u64::MAX]).check_remote().is_err());
        assert!(VectorTime(vec![3, 9]).check_remote().is_ok());
    }

    #[test]
    fn test_trailing_zeros_ignored() {
        let a = VectorTime(vec![1, 2]);
        let b = VectorTime(vec![1, 2, 0, 0]);
        assert_eq!(a, b);
        assert!(!a.happens_before(&b));
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Equal));
    }

    #[test]
    fn test_causal_chain() {
        let mut a = VectorClock::new(0);
        let mut b = VectorClock::new(1);

        let e1 = a.tick();
        let e2 = b.merge(&e1);

        assert!(e1.happens_before(&e2));
        assert!(!e2.happens_before(&e1));
        assert!(e1 < e2);
    }

    #[test]
    fn test_concurrent_events() {
        let mut a = VectorClock::new(0);
        let mut b = VectorClock::new(1);

        let ea = a.tick();
        let eb = b.tick();

        assert!(!ea.happens_before(&eb));
        assert!(!eb.happens_before(&ea));
        assert!(ea.concurrent_with(&eb));
        assert_eq!(ea.partial_cmp(&eb), None);
    }

    #[test]
    fn test_merge_is_elementwise_max() {
        let a = VectorTime(vec![3, 0, 1]);
        let b = VectorTime(vec![1, 4]);
        assert_eq!(a.merge(&b), VectorTime(vec![3, 4, 1]));
        assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn test_clock_merge_increments_own_slot() {
        let mut clock = VectorClock::new(2);
        let after = clock.merge(&VectorTime(vec![5, 1]));
        assert_eq!(after, VectorTime(vec![5, 1, 1]));
    }
}
