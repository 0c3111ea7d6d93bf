//! Last-writer-wins register

use crate::crdt::Merger;
use crate::types::InstanceId;
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Deterministic ordering between register values
///
/// Only consulted when two writes carry the same `(timestamp, instance)`
/// stamp, which a correct instance never produces. It keeps merge
/// commutative even for a misbehaving writer.
pub trait LwwValue: Clone + PartialEq {
    fn tie_break(&self, other: &Self) -> Ordering;
}

impl LwwValue for f64 {
    fn tie_break(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl LwwValue for String {
    fn tie_break(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl LwwValue for u64 {
    fn tie_break(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl LwwValue for bool {
    fn tie_break(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

/// Register keeping the value with the greatest `(timestamp, instance)`
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    #[n(0)]
    value: T,
    #[n(1)]
    timestamp: u64,
    #[n(2)]
    instance: InstanceId,
}

impl<T: LwwValue> LwwRegister<T> {
    pub fn new(value: T, timestamp: u64, instance: InstanceId) -> Self {
        Self {
            value,
            timestamp,
            instance,
        }
    }

    /// Initial value that any real write supersedes
    pub fn initial(value: T) -> Self {
        Self::new(value, 0, InstanceId::new(""))
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    fn stamp_cmp(&self, other: &Self) -> Ordering {
        (self.timestamp, &self.instance)
            .cmp(&(other.timestamp, &other.instance))
            .then_with(|| self.value.tie_break(&other.value))
    }

    /// Write a value; ignored if the register already holds a newer one
    ///
    /// Returns whether the write took effect.
    pub fn set(&mut self, value: T, timestamp: u64, instance: InstanceId) -> bool {
        let candidate = Self::new(value, timestamp, instance);
        if candidate.stamp_cmp(self) == Ordering::Greater {
            *self = candidate;
            true
        } else {
            false
        }
    }
}

impl<T: LwwValue> Merger for LwwRegister<T> {
    fn merge(&self, other: &Self) -> Self {
        match self.stamp_cmp(other) {
            Ordering::Less => other.clone(),
            _ => self.clone(),
        }
    }
}
