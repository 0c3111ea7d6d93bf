//! Cryptographic primitives module
//!
//! This module provides:
//! - Ed25519 signing and verification
//! - Deterministic SHA-384 record fingerprints
//! - Instance identities that never expose their private key

pub mod identity;
pub mod integrity;
pub mod signing;

pub use identity::{IdentityProvider, InstanceInfo, LocalIdentity};
pub use integrity::{fingerprint, verify, verify_signature, verify_vote, vote_encoding};
pub use signing::{Keypair, PublicKey, SecretKey};
