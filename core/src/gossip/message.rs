//! Gossip wire messages
//!
//! CBOR-encoded; variant indices are part of the wire contract and must
//! never be renumbered.

use crate::record::{MemoryRecord, ValidationVote};
use crate::types::{InstanceId, RecordId, SetDigest};
use crate::{Error, Result};
use bytes::Bytes;
use minicbor::{Decode, Encode};
use std::collections::BTreeSet;

/// Compact description of an instance's record id set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct IdSummary {
    #[n(0)]
    pub count: u64,
    #[n(1)]
    pub digest: SetDigest,
}

impl IdSummary {
    /// Blake3 over the ids in ascending order
    pub fn of(ids: &BTreeSet<RecordId>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for id in ids {
            hasher.update(id.as_bytes());
        }
        Self {
            count: ids.len() as u64,
            digest: SetDigest(*hasher.finalize().as_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum GossipMessage {
    /// Full record, sent to eager peers
    #[n(0)]
    Push {
        #[n(0)]
        record_id: RecordId,
        #[n(1)]
        record: MemoryRecord,
        #[n(2)]
        sender_id: InstanceId,
        #[n(3)]
        round: u32,
    },

    /// Record id only, sent to the lazy secondary set
    #[n(1)]
    Digest {
        #[n(0)]
        record_id: RecordId,
        #[n(1)]
        sender_id: InstanceId,
    },

    /// Ids the sender already holds; the receiver answers with the rest
    #[n(2)]
    PullRequest {
        #[n(0)]
        known_ids: Vec<RecordId>,
        #[n(1)]
        sender_id: InstanceId,
    },

    #[n(3)]
    PullResponse {
        #[n(0)]
        records: Vec<MemoryRecord>,
        #[n(1)]
        sender_id: InstanceId,
    },

    #[n(4)]
    Vote {
        #[n(0)]
        vote: ValidationVote,
        #[n(1)]
        sender_id: InstanceId,
    },

    #[n(5)]
    SummaryRequest {
        #[n(0)]
        sender_id: InstanceId,
    },

    #[n(6)]
    Summary {
        #[n(0)]
        summary: IdSummary,
        #[n(1)]
        sender_id: InstanceId,
    },

    #[n(7)]
    Ack {
        #[n(0)]
        sender_id: InstanceId,
    },
}

impl GossipMessage {
    pub fn sender_id(&self) -> &InstanceId {
        match self {
            GossipMessage::Push { sender_id, .. }
            | GossipMessage::Digest { sender_id, .. }
            | GossipMessage::PullRequest { sender_id, .. }
            | GossipMessage::PullResponse { sender_id, .. }
            | GossipMessage::Vote { sender_id, .. }
            | GossipMessage::SummaryRequest { sender_id }
            | GossipMessage::Summary { sender_id, .. }
            | GossipMessage::Ack { sender_id } => sender_id,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Push { .. } => "PUSH",
            GossipMessage::Digest { .. } => "DIGEST",
            GossipMessage::PullRequest { .. } => "PULL_REQUEST",
            GossipMessage::PullResponse { .. } => "PULL_RESPONSE",
            GossipMessage::Vote { .. } => "VOTE",
            GossipMessage::SummaryRequest { .. } => "SUMMARY_REQUEST",
            GossipMessage::Summary { .. } => "SUMMARY",
            GossipMessage::Ack { .. } => "ACK",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let buf = minicbor::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(minicbor::decode(bytes)?)
    }
}
