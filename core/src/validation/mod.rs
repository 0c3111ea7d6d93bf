//! Byzantine-resistant validation
//!
//! Votes are collected per record within a bounded window, deduplicated by
//! voter and aggregated with a supermajority threshold and a trimmed mean.

pub mod byzantine;
pub mod holdback;
pub mod window;

pub use byzantine::{
    median, threshold, trimmed_mean, ByzantineValidator, ValidationOutcome, ValidationReport, Validator,
};
pub use holdback::VoteHoldback;
pub use window::{Admission, VoteWindows};
