//! Instance identity
//!
//! An instance owns one signing key for its lifetime. The private half never
//! leaves this module: `describe()` yields the shareable part only.

use crate::crypto::signing::{Keypair, SecretKey};
use crate::types::{InstanceId, PublicKeyBytes, RecordId, Signature};
use serde::{Deserialize, Serialize};

/// Signs record fingerprints and votes on behalf of an instance
pub trait IdentityProvider: Send + Sync {
    fn instance_id(&self) -> &InstanceId;

    fn public_key(&self) -> PublicKeyBytes;

    /// Ordinal of this instance in vector timestamps
    fn vector_index(&self) -> usize;

    fn sign(&self, id: &RecordId) -> Signature;

    /// Sign an arbitrary domain-separated preimage
    fn sign_message(&self, message: &[u8]) -> Signature;
}

/// Public description of an instance, safe to send to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: InstanceId,
    pub public_key: PublicKeyBytes,
    pub vector_index: usize,
}

/// Identity backed by an in-process Ed25519 keypair
pub struct LocalIdentity {
    instance_id: InstanceId,
    keypair: Keypair,
    vector_index: usize,
}

impl LocalIdentity {
    /// Generate a fresh identity
    pub fn generate(instance_id: InstanceId, vector_index: usize) -> Self {
        Self {
            instance_id,
            keypair: Keypair::generate(),
            vector_index,
        }
    }

    /// Restore a persisted identity
    pub fn from_secret(instance_id: InstanceId, secret: &SecretKey, vector_index: usize) -> Self {
        Self {
            instance_id,
            keypair: secret.to_keypair(),
            vector_index,
        }
    }

    pub fn describe(&self) -> InstanceInfo {
        InstanceInfo {
            instance_id: self.instance_id.clone(),
            public_key: self.public_key(),
            vector_index: self.vector_index,
        }
    }
}

impl IdentityProvider for LocalIdentity {
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn public_key(&self) -> PublicKeyBytes {
        self.keypair.public_key().to_bytes()
    }

    fn vector_index(&self) -> usize {
        self.vector_index
    }

    fn sign(&self, id: &RecordId) -> Signature {
        self.keypair.sign_id(id)
    }

    fn sign_message(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("instance_id", &self.instance_id)
            .field("public_key", &self.public_key())
            .field("vector_index", &self.vector_index)
            .finish_non_exhaustive()
    }
}
