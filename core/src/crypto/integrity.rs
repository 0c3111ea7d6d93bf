//! Record fingerprinting and tamper detection
//!
//! A record id is the SHA-384 digest of a fixed canonical encoding:
//!
//! ```text
//! "chrysalis.memory.v1"
//! u64be(len(content)) || content (UTF-8)
//! u64be(len(type))    || type    (lowercase ASCII name)
//! u64be(created_at)              (milliseconds since the Unix epoch)
//! ```
//!
//! Length prefixes make the encoding unambiguous, so two distinct field
//! triples can never produce the same byte string. The owner signs the 48
//! digest bytes, not the content.
//!
//! Votes are signed by the voter over their own preimage, under a separate
//! domain so a vote signature can never pass as a record signature.

use crate::crypto::signing::PublicKey;
use crate::types::{InstanceId, MemoryType, PublicKeyBytes, RecordId, Signature};
use crate::{Error, Result};
use sha2::{Digest, Sha384};

/// Domain separator prefixed to every fingerprint preimage
pub const FINGERPRINT_DOMAIN: &[u8] = b"chrysalis.memory.v1";

/// Canonical preimage hashed into a record id
pub fn canonical_encoding(content: &str, memory_type: MemoryType, created_at: u64) -> Vec<u8> {
    let type_name = memory_type.as_str().as_bytes();
    let mut buf = Vec::with_capacity(FINGERPRINT_DOMAIN.len() + 24 + content.len() + type_name.len());
    buf.extend_from_slice(FINGERPRINT_DOMAIN);
    buf.extend_from_slice(&(content.len() as u64).to_be_bytes());
    buf.extend_from_slice(content.as_bytes());
    buf.extend_from_slice(&(type_name.len() as u64).to_be_bytes());
    buf.extend_from_slice(type_name);
    buf.extend_from_slice(&created_at.to_be_bytes());
    buf
}

/// Deterministic content fingerprint
pub fn fingerprint(content: &str, memory_type: MemoryType, created_at: u64) -> RecordId {
    let digest = Sha384::digest(canonical_encoding(content, memory_type, created_at));
    let mut id = [0u8; 48];
    id.copy_from_slice(&digest);
    RecordId(id)
}

/// Domain separator prefixed to every vote preimage
pub const VOTE_DOMAIN: &[u8] = b"chrysalis.vote.v1";

/// Preimage a voter signs
pub fn vote_encoding(voter: &InstanceId, record_id: &RecordId, confidence: f64, timestamp: u64) -> Vec<u8> {
    let voter = voter.as_str().as_bytes();
    let mut buf = Vec::with_capacity(VOTE_DOMAIN.len() + 24 + voter.len() + RecordId::LEN);
    buf.extend_from_slice(VOTE_DOMAIN);
    buf.extend_from_slice(&(voter.len() as u64).to_be_bytes());
    buf.extend_from_slice(voter);
    buf.extend_from_slice(record_id.as_bytes());
    buf.extend_from_slice(&confidence.to_bits().to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf
}

/// Check a vote signature against the voter's known key
pub fn verify_vote(
    voter: &InstanceId,
    record_id: &RecordId,
    confidence: f64,
    timestamp: u64,
    signature: &Signature,
    public_key: &PublicKeyBytes,
) -> Result<()> {
    let rejected = |reason: String| Error::VoteRejected {
        voter: voter.clone(),
        reason,
    };
    let key = PublicKey::from_bytes(public_key).map_err(|e| rejected(e.to_string()))?;
    key.verify(&vote_encoding(voter, record_id, confidence, timestamp), signature)
        .map_err(|e| rejected(e.to_string()))
}

/// Check a signature over the fingerprint bytes
pub fn verify_signature(id: &RecordId, signature: &Signature, public_key: &PublicKeyBytes) -> Result<()> {
    let key = PublicKey::from_bytes(public_key).map_err(|_| Error::Authentication { record_id: *id })?;
    key.verify(id.as_bytes(), signature)
        .map_err(|_| Error::Authentication { record_id: *id })
}

/// Full verification: recompute the fingerprint, then check the signature
///
/// A fingerprint mismatch is an `Integrity` error and is reported before the
/// signature is even looked at.
pub fn verify(
    content: &str,
    memory_type: MemoryType,
    created_at: u64,
    id: &RecordId,
    signature: &Signature,
    public_key: &PublicKeyBytes,
) -> Result<()> {
    if fingerprint(content, memory_type, created_at) != *id {
        return Err(Error::Integrity { record_id: *id });
    }
    verify_signature(id, signature, public_key)
}
