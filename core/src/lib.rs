//! Chrysalis Core Library
//!
//! Distributed memory consensus for independent agent instances.
//! This library provides the components needed to keep memory records in
//! sync without a central coordinator: content-addressed signed records,
//! logical clocks, gossip dissemination, Byzantine-resistant validation,
//! CRDT merge and convergent consolidation of near-duplicates.

pub mod clock;
pub mod config;
pub mod consolidation;
pub mod crdt;
pub mod crypto;
pub mod gossip;
pub mod node;
pub mod record;
pub mod simtest;
pub mod storage;
pub mod types;
pub mod validation;

pub use config::ConsensusConfig;
pub use node::MemoryNode;
pub use record::MemoryRecord;
pub use types::*;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Recomputed fingerprint does not match the claimed record id
    #[error("Integrity check failed for record {record_id}: recomputed fingerprint differs")]
    Integrity { record_id: RecordId },

    /// Signature does not verify against the record's public key
    #[error("Authentication failed for record {record_id}")]
    Authentication { record_id: RecordId },

    /// Vote failed the range, clock, population or signature check
    #[error("Vote from {voter} rejected: {reason}")]
    VoteRejected { voter: InstanceId, reason: String },

    /// Remote logical clock value too large to have been produced honestly
    #[error("Implausible logical clock value {counter}")]
    ImplausibleClock { counter: u64 },

    #[error("Insufficient votes: received {received}, required {required}")]
    InsufficientVotes { received: usize, required: usize },

    #[error("Peer unreachable: {peer}: {reason}")]
    PeerUnreachable { peer: InstanceId, reason: String },

    #[error("Consolidation did not converge after {iterations} iterations")]
    ConvergenceFailure { iterations: usize },

    /// A merge implementation broke commutativity, associativity or idempotence
    #[error("Merge contract violated: {0}")]
    MergeContractViolation(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Network operation failed: {0}")]
    Network(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Record not found: {0}")]
    NotFound(RecordId),

    #[error("Causal parent not present locally: {0}")]
    UnknownParent(RecordId),

    #[error("Node has stopped")]
    NodeStopped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether retrying later (or with another peer) may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::PeerUnreachable { .. } | Error::Network(_))
    }

    /// Failures that count against the sending peer
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Integrity { .. }
                | Error::Authentication { .. }
                | Error::VoteRejected { .. }
                | Error::ImplausibleClock { .. }
        )
    }
}

impl From<minicbor::decode::Error> for Error {
    fn from(e: minicbor::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
