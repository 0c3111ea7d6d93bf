//! Core types and identifiers used throughout the system

use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Agent instance identifier
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize)]
#[cbor(transparent)]
#[serde(transparent)]
pub struct InstanceId(#[n(0)] pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Fixed-size byte newtypes share serde (serde_bytes) and CBOR (byte string)
/// encodings and print as truncated hex.
macro_rules! fixed_bytes {
    ($name:ident, $len:expr, $label:literal) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}...)", $label, hex::encode(&self.0[..8]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0[..8]))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serde_bytes::serialize(&self.0[..], serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
                Self::from_slice(&bytes).ok_or_else(|| {
                    serde::de::Error::custom(concat!($label, " must be ", stringify!($len), " bytes"))
                })
            }
        }

        impl<C> Encode<C> for $name {
            fn encode<W: minicbor::encode::Write>(&self, e: &mut minicbor::Encoder<W>, _ctx: &mut C) -> Result<(), minicbor::encode::Error<W::Error>> {
                e.bytes(&self.0)?;
                Ok(())
            }
        }

        impl<'b, C> Decode<'b, C> for $name {
            fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
                let bytes = d.bytes()?;
                Self::from_slice(bytes).ok_or_else(|| {
                    minicbor::decode::Error::message(concat!($label, " must be ", stringify!($len), " bytes"))
                })
            }
        }
    };
}

/// Record identifier: SHA-384 fingerprint of the canonical record encoding
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub [u8; 48]);

fixed_bytes!(RecordId, 48, "RecordId");

/// Signature bytes (Ed25519)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(pub [u8; 64]);

fixed_bytes!(Signature, 64, "Signature");

/// Public key bytes (Ed25519 verifying key)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKeyBytes(pub [u8; 32]);

fixed_bytes!(PublicKeyBytes, 32, "PublicKey");

/// Blake3 digest over a set of record ids
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SetDigest(pub [u8; 32]);

fixed_bytes!(SetDigest, 32, "SetDigest");

/// Kind of memory a record holds
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize, Debug)]
#[cbor(index_only)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    #[n(0)]
    Observation,
    #[n(1)]
    Thought,
    #[n(2)]
    Action,
    #[n(3)]
    Result,
    #[n(4)]
    Conversation,
    #[n(5)]
    Knowledge,
}

impl MemoryType {
    pub const ALL: [MemoryType; 6] = [
        MemoryType::Observation,
        MemoryType::Thought,
        MemoryType::Action,
        MemoryType::Result,
        MemoryType::Conversation,
        MemoryType::Knowledge,
    ];

    /// Lowercase name, as hashed into the record fingerprint
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Observation => "observation",
            MemoryType::Thought => "thought",
            MemoryType::Action => "action",
            MemoryType::Result => "result",
            MemoryType::Conversation => "conversation",
            MemoryType::Knowledge => "knowledge",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        MemoryType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::Serialization(format!("unknown memory type: {}", s)))
    }
}

/// A known peer as seen from the local instance
#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct GossipPeer {
    #[n(0)]
    pub id: InstanceId,
    #[n(1)]
    pub endpoint: String,
    /// Reliability score in [0, 1]; lowered on failures, raised on success
    #[n(2)]
    pub score: f64,
    /// Key the peer signs votes with; votes from peers without one are refused
    #[n(3)]
    pub public_key: Option<PublicKeyBytes>,
}

impl GossipPeer {
    pub fn new(id: InstanceId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            score: 1.0,
            public_key: None,
        }
    }

    pub fn with_public_key(mut self, public_key: PublicKeyBytes) -> Self {
        self.public_key = Some(public_key);
        self
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_names() {
        for t in MemoryType::ALL {
            assert_eq!(t.as_str().parse::<MemoryType>().unwrap(), t);
        }
        assert!("dream".parse::<MemoryType>().is_err());
    }

    #[test]
    fn test_record_id_cbor() {
        let id = RecordId([3u8; 48]);
        let bytes = minicbor::to_vec(id).unwrap();
        let decoded: RecordId = minicbor::decode(&bytes).unwrap();
        assert_eq!(id, decoded);

        let short = minicbor::to_vec(minicbor::bytes::ByteVec::from(vec![1u8; 10])).unwrap();
        assert!(minicbor::decode::<RecordId>(&short).is_err());
    }

    #[test]
    fn test_signature_serde_rejects_wrong_length() {
        let sig = Signature([9u8; 64]);
        let json = serde_json::to_string(&sig).unwrap();
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, back);

        let bad = serde_json::to_string(&vec![1u8; 12]).unwrap();
        assert!(serde_json::from_str::<Signature>(&bad).is_err());
    }

    #[test]
    fn test_instance_id_ordering() {
        let a = InstanceId::new("alpha");
        let b = InstanceId::from("beta");
        assert!(a < b);
        assert_eq!(a.to_string(), "alpha");
    }
}
