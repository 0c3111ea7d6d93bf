//! CRDT merge engine
//!
//! Replica state is combined only through `Merger::merge`, which must be
//! commutative, associative and idempotent. There is no other
//! synchronization between instances.

pub mod contract;
pub mod gset;
pub mod lww;
pub mod orset;

#[cfg(test)]
mod convergence_tests;

pub use contract::check_merge_laws;
pub use gset::RecordSet;
pub use lww::{LwwRegister, LwwValue};
pub use orset::{OrSet, Tag};

/// State-based merge
pub trait Merger: Sized {
    /// Least upper bound of two states; a pure function of its inputs
    fn merge(&self, other: &Self) -> Self;

    fn merge_in(&mut self, other: &Self) {
        *self = self.merge(other);
    }
}

/// Kind of CRDT a piece of state is replicated as
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode, serde::Serialize, serde::Deserialize)]
#[cbor(index_only)]
pub enum CrdtKind {
    #[n(0)]
    GSet,
    #[n(1)]
    OrSet,
    #[n(2)]
    Lww,
}
