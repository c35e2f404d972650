//! Bounded wire collections — limits enforced at deserialization
//!
//! Decoding rejects a sequence the moment it would grow past its bound,
//! so a hostile peer cannot make the decoder allocate more than N
//! elements no matter what length its envelope announces.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

/// Hop records a discovery envelope may accumulate.
pub const MAX_VISITED: usize = 128;
/// Topics a peer may declare in one `report_paired`.
pub const MAX_TOPICS: usize = 256;
/// Application payload of a single `topic_message`.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;
/// Data of a single `file_chunk`.
pub const MAX_CHUNK_BYTES: usize = 8 * 1024 * 1024;
/// Opaque argument blob of a `proxy_call`.
pub const MAX_PROXY_ARG_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedVec<T, const N: usize>(pub Vec<T>);

impl<T, const N: usize> BoundedVec<T, N> {
    pub fn new(v: Vec<T>) -> Option<Self> {
        if v.len() <= N { Some(Self(v)) } else { None }
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }

    /// Push one element, refusing at the bound.
    pub fn push(&mut self, item: T) -> bool {
        if self.0.len() < N {
            self.0.push(item);
            true
        } else {
            false
        }
    }
}

impl<T, const N: usize> Default for BoundedVec<T, N> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T, const N: usize> std::ops::Deref for BoundedVec<T, N> {
    type Target = Vec<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Serialize, const N: usize> Serialize for BoundedVec<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for BoundedVec<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Guarded<T, const N: usize>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>, const N: usize> de::Visitor<'de> for Guarded<T, N> {
            type Value = BoundedVec<T, N>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "at most {N} wire elements")
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                // Fill through the bound-checked push: the N+1th element is
                // refused before it is stored, whatever length the frame
                // announced, so allocation never outruns the bound.
                let mut out = BoundedVec::default();
                while let Some(elem) = seq.next_element::<T>()? {
                    if !out.push(elem) {
                        return Err(de::Error::custom(format!(
                            "sequence exceeds the {N}-element wire bound"
                        )));
                    }
                }
                Ok(out)
            }
        }

        deserializer.deserialize_seq(Guarded(PhantomData))
    }
}

/// Bounded bytes (Vec<u8>) wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedBytes<const N: usize>(pub Vec<u8>);

impl<const N: usize> BoundedBytes<N> {
    pub fn new(v: Vec<u8>) -> Option<Self> {
        if v.len() <= N { Some(Self(v)) } else { None }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl<const N: usize> Default for BoundedBytes<N> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<const N: usize> std::ops::Deref for BoundedBytes<N> {
    type Target = Vec<u8>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> Serialize for BoundedBytes<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Bytes serialize as a u8 sequence (see Serialize above), so the
        // bounded sequence path decodes them symmetrically.
        BoundedVec::<u8, N>::deserialize(deserializer).map(|v| Self(v.into_inner()))
    }
}

/// Deserialize a wire value with postcard.
pub fn from_bytes<'de, T: Deserialize<'de>>(data: &'de [u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(data)
}

/// Serialize a wire value with postcard.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(value)
}
