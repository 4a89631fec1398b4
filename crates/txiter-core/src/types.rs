//! Ubiquitously used identifiers and the committed entry type.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sender-assigned sequence number of a broadcast transaction.
pub type SeqNum = u64;

/// Content-derived transaction identifier.
///
/// Digests are opaque bytes; they are rendered as lowercase hex in logs,
/// JSON and the CLI.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(Vec<u8>);

impl Digest {
    /// Wraps raw digest bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parses a hex encoded digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid hex.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the digest, returning the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl From<Vec<u8>> for Digest {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Digest {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Digest {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Stable identifier of an iterator process.
///
/// A restarted process keeps its id; the id is what checkpoints are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IteratorId(String);

impl IteratorId {
    /// Creates a new iterator id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IteratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IteratorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for IteratorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A `(seq#, digest)` pair. Immutable once committed to the digest store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqDigestEntry {
    /// Sequence number.
    pub seq: SeqNum,
    /// Digest observed or committed at `seq`.
    pub digest: Digest,
}

impl SeqDigestEntry {
    /// Creates a new entry.
    #[must_use]
    pub fn new(seq: SeqNum, digest: impl Into<Digest>) -> Self {
        Self {
            seq,
            digest: digest.into(),
        }
    }
}
