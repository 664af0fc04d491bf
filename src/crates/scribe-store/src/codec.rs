//! Snapshot codecs.
//!
//! A run snapshot is written twice: a readable tier for humans and
//! inspection tooling, and an authoritative tier the engine reloads from.
//! A [`SnapshotCodec`] binds a byte format to the tier it serves, so the
//! snapshot writer derives file names from the codec and cannot pair a
//! format with the wrong tier at a call site.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The role a codec plays in a snapshot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTier {
    /// Human-readable; never read back by the engine.
    Readable,
    /// Compact; what `load` trusts for resume.
    Authoritative,
}

impl SnapshotTier {
    /// File suffix for artifacts of this tier.
    pub fn suffix(&self) -> &'static str {
        match self {
            SnapshotTier::Readable => "json",
            SnapshotTier::Authoritative => "bin",
        }
    }
}

/// A byte format bound to the snapshot tier it serves.
pub trait SnapshotCodec: Send + Sync {
    /// Tier this codec writes and reads.
    fn tier(&self) -> SnapshotTier;

    /// Encode a value for this tier.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode a value written by [`encode`](Self::encode).
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// File name of an artifact in this tier, e.g. `graph.json`.
    fn file_name(&self, stem: &str) -> String {
        format!("{stem}.{}", self.tier().suffix())
    }
}

/// Readable-tier codec: JSON, pretty-printed by default.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    pretty: bool,
}

impl JsonCodec {
    /// Pretty-printed output, the default for snapshot directories.
    pub fn new() -> Self {
        Self { pretty: true }
    }

    /// Compact output, for payloads nobody reads by hand.
    pub fn compact() -> Self {
        Self { pretty: false }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCodec for JsonCodec {
    fn tier(&self) -> SnapshotTier {
        SnapshotTier::Readable
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(value)?
        } else {
            serde_json::to_vec(value)?
        };
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Authoritative-tier codec: bincode over the same serde model.
#[derive(Debug, Clone, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub fn new() -> Self {
        Self
    }
}

impl SnapshotCodec for BinaryCodec {
    fn tier(&self) -> SnapshotTier {
        SnapshotTier::Authoritative
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        nid: String,
        layer: u32,
    }

    fn sample() -> Sample {
        Sample {
            nid: "0.1.3".into(),
            layer: 3,
        }
    }

    #[test]
    fn test_tiers_name_their_files() {
        assert_eq!(JsonCodec::new().file_name("graph"), "graph.json");
        assert_eq!(BinaryCodec::new().file_name("graph"), "graph.bin");
        assert_eq!(BinaryCodec::new().file_name("memory"), "memory.bin");
    }

    #[test]
    fn test_both_tiers_round_trip() {
        let readable = JsonCodec::new();
        let authoritative = BinaryCodec::new();

        let restored: Sample = readable.decode(&readable.encode(&sample()).unwrap()).unwrap();
        assert_eq!(restored, sample());

        let restored: Sample = authoritative
            .decode(&authoritative.encode(&sample()).unwrap())
            .unwrap();
        assert_eq!(restored, sample());
    }

    #[test]
    fn test_pretty_and_compact_json_differ_only_in_whitespace() {
        let pretty = JsonCodec::new().encode(&sample()).unwrap();
        let compact = JsonCodec::compact().encode(&sample()).unwrap();

        assert!(pretty.contains(&b'\n'));
        assert!(!compact.contains(&b'\n'));

        let a: Sample = JsonCodec::new().decode(&pretty).unwrap();
        let b: Sample = JsonCodec::new().decode(&compact).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_authoritative_tier_rejects_readable_bytes() {
        let json = JsonCodec::new().encode(&sample()).unwrap();
        assert!(BinaryCodec::new().decode::<Sample>(&json).is_err());
    }
}
