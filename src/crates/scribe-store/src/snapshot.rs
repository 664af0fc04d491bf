//! Durable run snapshots.
//!
//! A snapshot directory holds four files plus a completion marker:
//!
//! ```text
//! <dir>/graph.json    graph, readable tier
//! <dir>/graph.bin     graph, authoritative tier
//! <dir>/memory.bin    memory state sufficient to rebuild derived caches
//! <dir>/article.txt   current running artifact
//! <dir>/done.marker   present iff the run reached a terminal state
//! ```
//!
//! The graph is written once per [`SnapshotCodec`] tier; file names come
//! from the codec, so the two tiers cannot drift apart structurally.
//! Every file is written to a temporary sibling and renamed into place, so
//! an observer never reads a half-written snapshot. The generic parameters
//! keep this crate independent of the engine's concrete graph types; the
//! engine hands in anything `Serialize` and gets it back on load.

use crate::codec::{BinaryCodec, JsonCodec, SnapshotCodec};
use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

const GRAPH_STEM: &str = "graph";
const MEMORY_STEM: &str = "memory";
const ARTICLE_TXT: &str = "article.txt";
const DONE_MARKER: &str = "done.marker";

/// Write a full snapshot of a run into `dir`, creating it if needed.
///
/// `done` controls the completion marker; it is written last so external
/// observers that poll for it always find a complete snapshot behind it.
pub fn save_snapshot<G, M>(dir: &Path, graph: &G, memory: &M, article: &str, done: bool) -> Result<()>
where
    G: Serialize,
    M: Serialize,
{
    std::fs::create_dir_all(dir)?;

    let readable = JsonCodec::new();
    let authoritative = BinaryCodec::new();

    write_atomic(dir, &readable.file_name(GRAPH_STEM), &readable.encode(graph)?)?;
    write_atomic(
        dir,
        &authoritative.file_name(GRAPH_STEM),
        &authoritative.encode(graph)?,
    )?;
    write_atomic(
        dir,
        &authoritative.file_name(MEMORY_STEM),
        &authoritative.encode(memory)?,
    )?;
    write_atomic(dir, ARTICLE_TXT, article.as_bytes())?;

    if done {
        write_atomic(dir, DONE_MARKER, b"")?;
    }

    debug!(dir = %dir.display(), done, "snapshot written");
    Ok(())
}

/// Load the authoritative snapshot tier from `dir`.
///
/// Returns the graph, the memory state, and the running article text.
pub fn load_snapshot<G, M>(dir: &Path) -> Result<(G, M, String)>
where
    G: DeserializeOwned,
    M: DeserializeOwned,
{
    let authoritative = BinaryCodec::new();

    let graph = authoritative.decode(&read_required(dir, &authoritative.file_name(GRAPH_STEM))?)?;
    let memory =
        authoritative.decode(&read_required(dir, &authoritative.file_name(MEMORY_STEM))?)?;
    let article = String::from_utf8_lossy(&read_required(dir, ARTICLE_TXT)?).into_owned();

    Ok((graph, memory, article))
}

/// Load only the readable graph tier, for inspection tooling.
pub fn load_graph_json(dir: &Path) -> Result<serde_json::Value> {
    let readable = JsonCodec::new();
    readable.decode(&read_required(dir, &readable.file_name(GRAPH_STEM))?)
}

/// Whether `dir` carries the completion marker.
pub fn is_done(dir: &Path) -> bool {
    dir.join(DONE_MARKER).is_file()
}

/// Whether `dir` looks like a snapshot at all: the authoritative graph
/// tier is the one file resume cannot do without.
pub fn snapshot_exists(dir: &Path) -> bool {
    dir.join(BinaryCodec::new().file_name(GRAPH_STEM)).is_file()
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let path = dir.join(name);
    let tmp = dir.join(format!("{name}.tmp"));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

fn read_required(dir: &Path, name: &str) -> Result<Vec<u8>> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(StoreError::incomplete(dir.display().to_string(), name));
    }
    Ok(std::fs::read(path)?)
}
