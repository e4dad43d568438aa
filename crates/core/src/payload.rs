//! Opaque payloads exchanged between clients, the master and workers.
//!
//! The master never looks inside a payload. Bytes are MessagePack-encoded so
//! problem code on both ends can move typed values without sharing a schema
//! with the scheduler.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// MessagePack-encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    #[serde(with = "serde_bytes_compat")]
    bytes: Vec<u8>,
}

impl Payload {
    /// Encode a value with MessagePack.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            bytes: rmp_serde::to_vec(value)?,
        })
    }

    /// Decode the payload into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.bytes)
    }

    /// Wrap raw bytes that are already encoded.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Helper module for serde to keep `Vec<u8>` a byte string in MessagePack.
mod serde_bytes_compat {
    use std::fmt;

    use serde::de::{SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_byte_buf(ByteBufVisitor)
    }

    struct ByteBufVisitor;

    impl<'de> Visitor<'de> for ByteBufVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        // JSON and other self-describing formats hand bytes over as a sequence.
        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}

/// One unit of dispatchable work produced by a [`Problem`](crate::Problem).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialProblem(pub Payload);

/// Result of computing one [`PartialProblem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSolution(pub Payload);

/// Final answer of a problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution(pub Payload);

macro_rules! payload_newtype {
    ($name:ident) => {
        impl $name {
            pub fn encode<T: Serialize>(value: &T) -> Result<Self, rmp_serde::encode::Error> {
                Payload::encode(value).map(Self)
            }

            pub fn decode<T: DeserializeOwned>(&self) -> Result<T, rmp_serde::decode::Error> {
                self.0.decode()
            }

            pub fn payload(&self) -> &Payload {
                &self.0
            }
        }
    };
}

payload_newtype!(PartialProblem);
payload_newtype!(PartialSolution);
payload_newtype!(Solution);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Range {
        start: u64,
        end: u64,
    }

    #[test]
    fn typed_values_survive_encoding() {
        let pp = PartialProblem::encode(&Range { start: 10, end: 20 }).unwrap();
        assert!(!pp.payload().is_empty());
        let back: Range = pp.decode().unwrap();
        assert_eq!(back, Range { start: 10, end: 20 });
    }

    #[test]
    fn decoding_into_wrong_type_fails() {
        let s = Solution::encode(&"hello").unwrap();
        assert!(s.decode::<Range>().is_err());
    }

    #[test]
    fn raw_bytes_are_kept_verbatim() {
        let p = Payload::from_bytes(vec![1, 2, 3]);
        assert_eq!(p.as_bytes(), &[1, 2, 3]);
        assert_eq!(p.len(), 3);
    }
}
