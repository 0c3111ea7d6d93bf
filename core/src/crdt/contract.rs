//! Runtime check of the merge laws
//!
//! A violation is a programming error in a `Merger` implementation. Tests
//! call this; production code paths never should.

use crate::crdt::Merger;
use crate::{Error, Result};
use std::fmt::Debug;

/// Verify commutativity, associativity and idempotence on three samples
pub fn check_merge_laws<T>(a: &T, b: &T, c: &T) -> Result<()>
where
    T: Merger + PartialEq + Debug,
{
    if a.merge(b) != b.merge(a) {
        return Err(Error::MergeContractViolation(format!(
            "merge is not commutative for {:?} and {:?}",
            a, b
        )));
    }

    if a.merge(b).merge(c) != a.merge(&b.merge(c)) {
        return Err(Error::MergeContractViolation(format!(
            "merge is not associative for {:?}, {:?}, {:?}",
            a, b, c
        )));
    }

    for x in [a, b, c] {
        if x.merge(x) != *x {
            return Err(Error::MergeContractViolation(format!(
                "merge is not idempotent for {:?}",
                x
            )));
        }
    }

    Ok(())
}
