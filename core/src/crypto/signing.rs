//! Ed25519 signing and verification

use crate::types::{PublicKeyBytes, RecordId, Signature};
use crate::{Error, Result};
use ed25519_dalek::Signer;
use rand::rngs::OsRng;
use zeroize::Zeroize;

/// Ed25519 keypair
#[derive(Clone)]
pub struct Keypair {
    inner: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let inner = ed25519_dalek::SigningKey::generate(&mut rng);
        Self { inner }
    }

    /// Create keypair from secret key bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let inner = ed25519_dalek::SigningKey::from_bytes(bytes);
        Self { inner }
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.inner.sign(message);
        Signature(sig.to_bytes())
    }

    /// Sign a record fingerprint
    pub fn sign_id(&self, id: &RecordId) -> Signature {
        self.sign(id.as_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair(public={})", self.public_key().to_bytes())
    }
}

/// Ed25519 public key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Create public key from bytes
    pub fn from_bytes(bytes: &PublicKeyBytes) -> Result<Self> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes.as_bytes())
            .map_err(|e| Error::Crypto(format!("Invalid public key: {}", e)))?;
        Ok(Self { inner })
    }

    /// Get the public key bytes
    pub fn to_bytes(&self) -> PublicKeyBytes {
        PublicKeyBytes(self.inner.to_bytes())
    }

    /// Verify a signature
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.inner
            .verify_strict(message, &sig)
            .map_err(|e| Error::Crypto(format!("signature rejected: {}", e)))
    }
}

/// Ed25519 secret key bytes, wiped on drop
///
/// Used to restore an identity; signing always goes through `Keypair`.
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Convert to keypair
    pub fn to_keypair(&self) -> Keypair {
        Keypair::from_bytes(&self.bytes)
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::generate();
        let message = b"Hello, Chrysalis!";

        let signature = keypair.sign(message);
        let public_key = keypair.public_key();

        assert!(public_key.verify(message, &signature).is_ok());
    }

    #[test]
    fn test_invalid_signature() {
        let keypair1 = Keypair::generate();
        let keypair2 = Keypair::generate();
        let message = b"Test message";

        let signature = keypair1.sign(message);
        let public_key2 = keypair2.public_key();

        assert!(public_key2.verify(message, &signature).is_err());
    }

    #[test]
    fn test_secret_key_restores_keypair() {
        let keypair = Keypair::generate();
        let restored = SecretKey::from_bytes(keypair.inner.to_bytes()).to_keypair();
        assert_eq!(keypair.public_key(), restored.public_key());

        let id = RecordId([1u8; 48]);
        let sig = restored.sign_id(&id);
        assert!(keypair.public_key().verify(id.as_bytes(), &sig).is_ok());
    }

    #[test]
    fn test_public_key_bytes_roundtrip() {
        let keypair = Keypair::generate();
        let bytes = keypair.public_key().to_bytes();
        assert_eq!(PublicKey::from_bytes(&bytes).unwrap(), keypair.public_key());
    }
}
