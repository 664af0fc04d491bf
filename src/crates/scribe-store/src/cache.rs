//! At-most-once memoization of capability calls.
//!
//! The cache maps a [`Fingerprint`] to the JSON result of a previously
//! completed call. Concurrent callers with an identical fingerprint share a
//! single underlying computation: the first caller installs an in-flight
//! slot backed by a watch channel, late arrivals await it and observe the
//! same outcome. Successful results are durable when a persistence root is
//! configured; errors are delivered to waiters but never stored.
//!
//! On-disk layout: `<root>/<namespace>/<hex[0..2]>/<hex>`, one JSON file per
//! fingerprint. Files are written to a temp path and renamed so readers
//! never observe partial entries.

use crate::error::{Result, StoreError};
use crate::fingerprint::Fingerprint;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Outcome of a cached computation.
///
/// `Ok` results are memoized; `Err` carries a JSON-encoded error that is
/// shared with concurrent waiters but never written to the cache.
pub type ComputeOutcome = std::result::Result<Value, Value>;

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Lookups answered from memory or disk.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Computations actually performed.
    pub computations: u64,
    /// Callers that joined an in-flight computation.
    pub joined: u64,
}

enum Slot {
    Ready(Value),
    InFlight(watch::Receiver<Option<ComputeOutcome>>),
}

enum Claim {
    Hit(Value),
    Waiter(watch::Receiver<Option<ComputeOutcome>>),
    Leader(watch::Sender<Option<ComputeOutcome>>),
}

struct Inner {
    slots: HashMap<String, Slot>,
    metrics: CacheMetrics,
}

/// Content-addressed call cache for one resource class.
///
/// A run typically holds two instances, one for the `llm` namespace and one
/// for `search`. All methods take `&self`; interior state is guarded by a
/// mutex that is never held across an await point.
pub struct CallCache {
    namespace: String,
    dir: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl CallCache {
    /// Create a memory-only cache for the given namespace.
    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            dir: None,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                metrics: CacheMetrics::default(),
            }),
        }
    }

    /// Create a cache persisted under `<root>/<namespace>`.
    pub fn persistent(namespace: impl Into<String>, root: &Path) -> Result<Self> {
        let namespace = namespace.into();
        let dir = root.join(&namespace);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            namespace,
            dir: Some(dir),
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                metrics: CacheMetrics::default(),
            }),
        })
    }

    /// Namespace this cache serves.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether successful results survive process restarts.
    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Snapshot of the effectiveness counters.
    pub fn metrics(&self) -> CacheMetrics {
        self.inner.lock().metrics
    }

    /// Pure lookup: memory first, then disk. Never triggers computation and
    /// never joins an in-flight slot.
    pub fn get(&self, fp: &Fingerprint) -> Option<Value> {
        {
            let inner = self.inner.lock();
            if let Some(Slot::Ready(value)) = inner.slots.get(fp.as_hex()) {
                return Some(value.clone());
            }
        }
        self.read_disk(fp)
    }

    /// Return the cached result for `fp`, computing it at most once across
    /// concurrent callers.
    ///
    /// The first caller for a given fingerprint runs `compute`; every
    /// concurrent caller with the same fingerprint blocks on the in-flight
    /// slot and observes the identical outcome. An `Err` outcome resolves
    /// waiters but leaves no cache entry, so a later call computes again.
    pub async fn get_or_compute<F, Fut>(&self, fp: &Fingerprint, compute: F) -> Result<ComputeOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ComputeOutcome>,
    {
        let claim = match self.existing_claim(fp) {
            Some(claim) => claim,
            None => {
                // Disk probe happens without the lock held.
                if let Some(value) = self.read_disk(fp) {
                    self.store_ready(fp, &value, true);
                    return Ok(Ok(value));
                }
                self.claim_or_install(fp)
            }
        };

        match claim {
            Claim::Hit(value) => Ok(Ok(value)),
            Claim::Waiter(mut rx) => {
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| StoreError::Abandoned(fp.as_hex().to_string()))?
                    .clone();
                // wait_for only resolves once the leader published Some.
                outcome.ok_or_else(|| StoreError::Abandoned(fp.as_hex().to_string()))
            }
            Claim::Leader(tx) => {
                self.inner.lock().metrics.computations += 1;
                let outcome = compute().await;

                match &outcome {
                    Ok(value) => {
                        if let Err(err) = self.write_disk(fp, value) {
                            warn!(
                                namespace = %self.namespace,
                                fingerprint = %fp,
                                error = %err,
                                "failed to persist cache entry"
                            );
                        }
                        self.store_ready(fp, value, false);
                    }
                    Err(_) => {
                        // Errors are not cached: drop the slot so the next
                        // caller computes again.
                        self.inner.lock().slots.remove(fp.as_hex());
                    }
                }

                let _ = tx.send(Some(outcome.clone()));
                Ok(outcome)
            }
        }
    }

    /// Look up an existing memory slot, counting the hit or join.
    fn existing_claim(&self, fp: &Fingerprint) -> Option<Claim> {
        let mut inner = self.inner.lock();
        let claim = match inner.slots.get(fp.as_hex()) {
            Some(Slot::Ready(value)) => Some(Claim::Hit(value.clone())),
            Some(Slot::InFlight(rx)) => Some(Claim::Waiter(rx.clone())),
            None => None,
        };
        match &claim {
            Some(Claim::Hit(_)) => inner.metrics.hits += 1,
            Some(Claim::Waiter(_)) => inner.metrics.joined += 1,
            _ => {}
        }
        claim
    }

    /// Re-check for a racing caller, then install this caller as leader.
    fn claim_or_install(&self, fp: &Fingerprint) -> Claim {
        let mut inner = self.inner.lock();
        let claim = match inner.slots.get(fp.as_hex()) {
            Some(Slot::Ready(value)) => Some(Claim::Hit(value.clone())),
            Some(Slot::InFlight(rx)) => Some(Claim::Waiter(rx.clone())),
            None => None,
        };
        match claim {
            Some(existing) => {
                match &existing {
                    Claim::Hit(_) => inner.metrics.hits += 1,
                    Claim::Waiter(_) => inner.metrics.joined += 1,
                    Claim::Leader(_) => {}
                }
                existing
            }
            None => {
                let (tx, rx) = watch::channel(None);
                inner
                    .slots
                    .insert(fp.as_hex().to_string(), Slot::InFlight(rx));
                inner.metrics.misses += 1;
                Claim::Leader(tx)
            }
        }
    }

    /// Publish a ready value into the memory map.
    ///
    /// When `only_if_vacant` is set (disk promotion) an in-flight slot is
    /// left alone so its waiters still resolve through the leader.
    fn store_ready(&self, fp: &Fingerprint, value: &Value, only_if_vacant: bool) {
        let mut inner = self.inner.lock();
        if only_if_vacant && inner.slots.contains_key(fp.as_hex()) {
            inner.metrics.hits += 1;
            return;
        }
        if only_if_vacant {
            inner.metrics.hits += 1;
        }
        inner
            .slots
            .insert(fp.as_hex().to_string(), Slot::Ready(value.clone()));
    }

    fn entry_path(&self, fp: &Fingerprint) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(fp.prefix()).join(fp.as_hex()))
    }

    fn read_disk(&self, fp: &Fingerprint) -> Option<Value> {
        let path = self.entry_path(fp)?;
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!(namespace = %self.namespace, fingerprint = %fp, "cache entry loaded from disk");
                Some(value)
            }
            Err(err) => {
                warn!(
                    namespace = %self.namespace,
                    path = %path.display(),
                    error = %err,
                    "discarding unreadable cache entry"
                );
                None
            }
        }
    }

    fn write_disk(&self, fp: &Fingerprint, value: &Value) -> Result<()> {
        let Some(path) = self.entry_path(fp) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
