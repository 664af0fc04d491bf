//! # scribe-store - Persistence for the scribe engine
//!
//! Two concerns live here, both deliberately independent of the engine's
//! concrete types so this crate sits at the bottom of the workspace:
//!
//! - **Call cache** ([`CallCache`]): content-addressed, at-most-once
//!   memoization of capability calls, with per-fingerprint single-flight
//!   semantics and optional on-disk durability.
//! - **Snapshots** ([`snapshot`]): atomic save/load of a run's graph,
//!   memory, and running artifact, written once per [`SnapshotCodec`]
//!   tier: a readable JSON tier and an authoritative binary tier.

pub mod cache;
pub mod codec;
pub mod error;
pub mod fingerprint;
pub mod snapshot;

pub use cache::{CacheMetrics, CallCache, ComputeOutcome};
pub use codec::{BinaryCodec, JsonCodec, SnapshotCodec, SnapshotTier};
pub use error::{Result, StoreError};
pub use fingerprint::Fingerprint;
pub use snapshot::{is_done, load_graph_json, load_snapshot, save_snapshot, snapshot_exists};
