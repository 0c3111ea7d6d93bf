//! Memory records
//!
//! A record's core fields (content, type, creation time) are fixed at birth
//! and bound to its id by the fingerprint. Everything in `RecordMeta` may
//! evolve, but only through `Merger::merge`.

use crate::clock::{self, VectorTime};
use crate::crdt::{CrdtKind, LwwRegister, Merger, OrSet};
use crate::crypto::{self, IdentityProvider};
use crate::types::*;
use crate::{Error, Result};
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Importance assigned to records that never had one set
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// One instance's opinion of a record, signed by the voter
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct ValidationVote {
    #[n(0)]
    pub instance_id: InstanceId,
    #[n(1)]
    pub record_id: RecordId,
    /// In [0, 1]
    #[n(2)]
    pub confidence: f64,
    /// Lamport time of the vote on the voting instance
    #[n(3)]
    pub timestamp: u64,
    /// Over `crypto::vote_encoding` of the fields above
    #[n(4)]
    pub signature: Signature,
}

impl ValidationVote {
    /// Unsigned vote; peers reject it until it is signed
    pub fn new(instance_id: InstanceId, record_id: RecordId, confidence: f64, timestamp: u64) -> Result<Self> {
        let vote = Self {
            instance_id,
            record_id,
            confidence,
            timestamp,
            signature: Signature([0; 64]),
        };
        vote.check_range()?;
        Ok(vote)
    }

    /// Vote as `identity`, signed with its key
    pub fn signed(identity: &dyn IdentityProvider, record_id: RecordId, confidence: f64, timestamp: u64) -> Result<Self> {
        let mut vote = Self::new(identity.instance_id().clone(), record_id, confidence, timestamp)?;
        vote.signature = identity.sign_message(&vote.signing_bytes());
        Ok(vote)
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        crypto::vote_encoding(&self.instance_id, &self.record_id, self.confidence, self.timestamp)
    }

    /// Confidence must be a number in [0, 1]
    pub fn check_range(&self) -> Result<()> {
        if (0.0..=1.0).contains(&self.confidence) {
            Ok(())
        } else {
            Err(Error::VoteRejected {
                voter: self.instance_id.clone(),
                reason: format!("confidence {} outside [0, 1]", self.confidence),
            })
        }
    }

    /// Full check of a received vote against the voter's known key
    pub fn verify(&self, voter_key: &PublicKeyBytes) -> Result<()> {
        self.check_range()?;
        clock::check_remote(self.timestamp)?;
        crypto::verify_vote(
            &self.instance_id,
            &self.record_id,
            self.confidence,
            self.timestamp,
            &self.signature,
            voter_key,
        )
    }

    /// Later vote from the same instance replaces the earlier one
    fn supersedes(&self, other: &ValidationVote) -> bool {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.confidence.total_cmp(&other.confidence))
            .then_with(|| self.record_id.cmp(&other.record_id))
            .then_with(|| self.signature.cmp(&other.signature))
            == Ordering::Greater
    }
}

/// Validator verdict attached to a record
///
/// Only ever written by the local validator. Assessments arriving with a
/// peer's copy of the record are discarded on receipt.
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct Assessment {
    #[n(0)]
    pub trimmed_mean: f64,
    #[n(1)]
    pub median: f64,
    #[n(2)]
    pub vote_count: usize,
    #[n(3)]
    pub valid: bool,
}

impl Assessment {
    /// Total order used to pick one assessment when replicas disagree:
    /// more votes first, then the numeric fields.
    fn rank(&self, other: &Assessment) -> Ordering {
        self.vote_count
            .cmp(&other.vote_count)
            .then_with(|| self.trimmed_mean.total_cmp(&other.trimmed_mean))
            .then_with(|| self.median.total_cmp(&other.median))
            .then_with(|| self.valid.cmp(&other.valid))
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct GossipMeta {
    #[n(0)]
    pub origin_instance: InstanceId,
    #[n(1)]
    pub seen_by: BTreeSet<InstanceId>,
    #[n(2)]
    pub fanout: u32,
    #[n(3)]
    pub round: u32,
}

impl Merger for GossipMeta {
    fn merge(&self, other: &Self) -> Self {
        Self {
            origin_instance: self.origin_instance.clone().min(other.origin_instance.clone()),
            seen_by: self.seen_by.union(&other.seen_by).cloned().collect(),
            fanout: self.fanout.max(other.fanout),
            round: self.round.max(other.round),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct ValidationMeta {
    /// At most one vote per instance
    #[n(0)]
    pub votes: BTreeMap<InstanceId, ValidationVote>,
    #[n(1)]
    pub assessment: Option<Assessment>,
}

impl ValidationMeta {
    /// Instances whose vote is recorded
    pub fn verified_by(&self) -> BTreeSet<InstanceId> {
        self.votes.keys().cloned().collect()
    }

    pub fn confidence_score(&self) -> Option<f64> {
        self.assessment.as_ref().map(|a| a.trimmed_mean)
    }

    pub fn meets_threshold(&self) -> bool {
        self.assessment.as_ref().map(|a| a.valid).unwrap_or(false)
    }

    /// Insert or replace an instance's vote; returns whether anything changed
    pub fn record_vote(&mut self, vote: ValidationVote) -> bool {
        match self.votes.get(&vote.instance_id) {
            Some(existing) if !vote.supersedes(existing) => false,
            _ => {
                self.votes.insert(vote.instance_id.clone(), vote);
                true
            }
        }
    }
}

impl Merger for ValidationMeta {
    fn merge(&self, other: &Self) -> Self {
        let mut votes = self.votes.clone();
        for vote in other.votes.values() {
            match votes.get(&vote.instance_id) {
                Some(existing) if !vote.supersedes(existing) => {}
                _ => {
                    votes.insert(vote.instance_id.clone(), vote.clone());
                }
            }
        }
        let assessment = match (&self.assessment, &other.assessment) {
            (Some(a), Some(b)) => Some(if a.rank(b) == Ordering::Less { b.clone() } else { a.clone() }),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        Self { votes, assessment }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct CrdtMeta {
    #[n(0)]
    pub kind: CrdtKind,
    #[n(1)]
    pub added_by: BTreeSet<InstanceId>,
    /// Earliest time any instance added the record
    #[n(2)]
    pub timestamp: u64,
}

impl Merger for CrdtMeta {
    fn merge(&self, other: &Self) -> Self {
        Self {
            kind: self.kind.max(other.kind),
            added_by: self.added_by.union(&other.added_by).cloned().collect(),
            timestamp: self.timestamp.min(other.timestamp),
        }
    }
}

/// Provenance of a consolidated record
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct ConvergenceMeta {
    /// Records folded into this one (includes itself once consolidated)
    #[n(0)]
    pub sources: BTreeSet<RecordId>,
    /// Trimmed-mean confidence of the cluster; the latest consolidation wins
    #[n(1)]
    pub confidence: Option<LwwRegister<f64>>,
}

impl ConvergenceMeta {
    pub fn confidence(&self) -> Option<f64> {
        self.confidence.as_ref().map(|r| *r.value())
    }

    /// Write the consolidated confidence; returns whether it took effect
    pub fn set_confidence(&mut self, value: f64, timestamp: u64, instance: InstanceId) -> bool {
        match &mut self.confidence {
            Some(register) => register.set(value, timestamp, instance),
            None => {
                self.confidence = Some(LwwRegister::new(value, timestamp, instance));
                true
            }
        }
    }
}

impl Merger for ConvergenceMeta {
    fn merge(&self, other: &Self) -> Self {
        let confidence = match (&self.confidence, &other.confidence) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        Self {
            sources: self.sources.union(&other.sources).cloned().collect(),
            confidence,
        }
    }
}

/// Causal stamps taken when a record is created
#[derive(Debug, Clone, Default)]
pub struct CausalStamp {
    pub lamport_time: u64,
    pub vector_time: VectorTime,
    pub causal_parents: BTreeSet<RecordId>,
}

/// Mutable metadata of a record
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct RecordMeta {
    #[n(0)]
    pub lamport_time: u64,
    #[n(1)]
    pub vector_time: VectorTime,
    /// Parent record ids, resolved through the store
    #[n(2)]
    pub causal_parents: BTreeSet<RecordId>,
    #[n(3)]
    pub gossip: GossipMeta,
    #[n(4)]
    pub validation: ValidationMeta,
    #[n(5)]
    pub crdt: CrdtMeta,
    #[n(6)]
    pub importance: LwwRegister<f64>,
    #[n(7)]
    pub labels: OrSet<String>,
    #[n(8)]
    pub convergence: ConvergenceMeta,
}

impl Merger for RecordMeta {
    fn merge(&self, other: &Self) -> Self {
        Self {
            lamport_time: self.lamport_time.max(other.lamport_time),
            vector_time: self.vector_time.merge(&other.vector_time),
            causal_parents: self.causal_parents.union(&other.causal_parents).copied().collect(),
            gossip: self.gossip.merge(&other.gossip),
            validation: self.validation.merge(&other.validation),
            crdt: self.crdt.merge(&other.crdt),
            importance: self.importance.merge(&other.importance),
            labels: self.labels.merge(&other.labels),
            convergence: self.convergence.merge(&other.convergence),
        }
    }
}

impl RecordMeta {
    /// Reject logical times no honest instance could have reached
    pub fn check_remote_clocks(&self) -> Result<()> {
        clock::check_remote(self.lamport_time)?;
        self.vector_time.check_remote()?;
        clock::check_remote(self.importance.timestamp())?;
        if let Some(register) = &self.convergence.confidence {
            clock::check_remote(register.timestamp())?;
        }
        for vote in self.validation.votes.values() {
            clock::check_remote(vote.timestamp)?;
        }
        Ok(())
    }

    /// Whether `other` differs in state peers care about re-receiving
    pub fn attributes_differ(&self, other: &RecordMeta) -> bool {
        self.validation.votes != other.validation.votes
            || self.importance != other.importance
            || self.labels != other.labels
            || self.convergence != other.convergence
    }
}

/// A signed, content-addressed memory record
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[n(0)]
    id: RecordId,
    #[n(1)]
    content: String,
    #[n(2)]
    memory_type: MemoryType,
    #[n(3)]
    created_at: u64,
    #[n(4)]
    signature: Signature,
    #[n(5)]
    public_key: PublicKeyBytes,
    #[n(6)]
    pub meta: RecordMeta,
}

impl MemoryRecord {
    /// Fingerprint and sign a new record
    pub fn new_signed(
        identity: &dyn IdentityProvider,
        content: impl Into<String>,
        memory_type: MemoryType,
        created_at: u64,
        stamp: CausalStamp,
    ) -> Self {
        let content = content.into();
        let id = crypto::fingerprint(&content, memory_type, created_at);
        let signature = identity.sign(&id);
        let me = identity.instance_id().clone();

        let meta = RecordMeta {
            lamport_time: stamp.lamport_time,
            vector_time: stamp.vector_time,
            causal_parents: stamp.causal_parents,
            gossip: GossipMeta {
                origin_instance: me.clone(),
                seen_by: BTreeSet::from([me.clone()]),
                fanout: 0,
                round: 0,
            },
            validation: ValidationMeta::default(),
            crdt: CrdtMeta {
                kind: CrdtKind::GSet,
                added_by: BTreeSet::from([me]),
                timestamp: created_at,
            },
            importance: LwwRegister::initial(DEFAULT_IMPORTANCE),
            labels: OrSet::new(),
            convergence: ConvergenceMeta::default(),
        };

        Self {
            id,
            content,
            memory_type,
            created_at,
            signature,
            public_key: identity.public_key(),
            meta,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }

    pub fn origin(&self) -> &InstanceId {
        &self.meta.gossip.origin_instance
    }

    pub fn importance(&self) -> f64 {
        *self.meta.importance.value()
    }

    pub fn labels(&self) -> Vec<String> {
        self.meta.labels.elements()
    }

    /// Best known confidence: the consolidated value if this record is a
    /// canonical representative, else its own
    pub fn confidence(&self) -> f64 {
        self.meta.convergence.confidence().unwrap_or_else(|| self.own_confidence())
    }

    /// The validator's trimmed mean, else importance
    pub fn own_confidence(&self) -> f64 {
        self.meta
            .validation
            .confidence_score()
            .unwrap_or_else(|| self.importance())
    }

    /// Recompute the fingerprint and check the signature
    pub fn verify(&self) -> Result<()> {
        crypto::verify(
            &self.content,
            self.memory_type,
            self.created_at,
            &self.id,
            &self.signature,
            &self.public_key,
        )
    }

    /// Merge two replicas of the same record
    pub fn merge(&self, other: &MemoryRecord) -> Result<MemoryRecord> {
        if self.id != other.id {
            return Err(Error::MergeContractViolation(format!(
                "cannot merge distinct records {} and {}",
                self.id, other.id
            )));
        }
        Ok(self.merge_same(other))
    }

    /// Merge assuming equal ids
    ///
    /// Equal ids imply equal content. Two instances may still have signed
    /// the same fingerprint with different keys, so the signer is chosen by
    /// a fixed order to keep the result independent of argument order.
    pub(crate) fn merge_same(&self, other: &MemoryRecord) -> MemoryRecord {
        let core = if (self.public_key, self.signature) <= (other.public_key, other.signature) {
            self
        } else {
            other
        };
        MemoryRecord {
            id: core.id,
            content: core.content.clone(),
            memory_type: core.memory_type,
            created_at: core.created_at,
            signature: core.signature,
            public_key: core.public_key,
            meta: self.meta.merge(&other.meta),
        }
    }
}
