//! Content-addressed fingerprints for capability calls.
//!
//! A fingerprint is a stable SHA-256 hash over the full request tuple
//! (resource class, model, prompt, arguments). Two calls with the same
//! fingerprint are interchangeable as far as the cache is concerned.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identity of a capability request, rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a request tuple.
    ///
    /// The arguments value is serialized with `serde_json`, whose map key
    /// ordering is insertion-ordered; callers must build the arguments the
    /// same way on every attempt for retries to share a fingerprint.
    pub fn compute(class: &str, model: &str, prompt: &str, args: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(class.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(prompt.as_bytes());
        hasher.update([0u8]);
        hasher.update(args.to_string().as_bytes());

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        Self(hex)
    }

    /// Construct from a precomputed hex digest. Used when re-keying
    /// persisted entries on load.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Hex digest of this fingerprint.
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Two-character directory prefix used to partition the on-disk layout.
    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
