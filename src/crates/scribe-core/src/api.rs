//! Public API over the engine: run lifecycle management.
//!
//! The [`RunManager`] owns every active run in the process. Starting a run
//! creates an engine, spawns its scheduler on a background task, and tracks
//! a handle carrying the event bus, the cancel flag, and terminal state.
//! Completed runs persist as snapshot directories under the manager's root
//! and remain visible to `list_runs` across restarts.

use crate::config::{Mode, ScribeConfig};
use crate::capability::CapabilityRegistry;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::event::{RunId, SubscriberItem, TokenUsage};
use crate::graph::GraphView;
use crate::node::NodeStatus;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

/// Coarse lifecycle state surfaced through the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Error,
}

/// Status record for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub status: RunState,
    /// Finished nodes over total nodes, in percent.
    pub progress_percent: f32,
    pub root_status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_node_nid: Option<String>,
    pub usage: TokenUsage,
}

struct Terminal {
    state: RunState,
    error_kind: Option<String>,
    error_message: Option<String>,
    failing_node_nid: Option<String>,
    result: Option<String>,
    at: DateTime<Utc>,
}

struct RunHandle {
    engine: Arc<Engine>,
    dir: PathBuf,
    started_at: DateTime<Utc>,
    terminal: RwLock<Option<Terminal>>,
}

impl RunHandle {
    fn status(&self, run_id: &str) -> RunStatus {
        let arena = self.engine.arena();
        let arena = arena.read();
        let (finished, total) = arena.progress();
        let root_status = arena
            .get(arena.root())
            .map(|n| n.status)
            .unwrap_or(NodeStatus::NotReady);
        drop(arena);

        let terminal = self.terminal.read();
        let (status, updated_at) = match &*terminal {
            Some(t) => (t.state, t.at),
            None => (RunState::Running, Utc::now()),
        };
        RunStatus {
            run_id: run_id.to_string(),
            status,
            progress_percent: if total == 0 {
                0.0
            } else {
                (finished as f32 / total as f32) * 100.0
            },
            root_status,
            started_at: self.started_at,
            updated_at,
            error_kind: terminal.as_ref().and_then(|t| t.error_kind.clone()),
            error_message: terminal.as_ref().and_then(|t| t.error_message.clone()),
            failing_node_nid: terminal.as_ref().and_then(|t| t.failing_node_nid.clone()),
            usage: self.engine.usage(),
        }
    }
}

/// Owner of all runs in this process.
pub struct RunManager {
    root_dir: PathBuf,
    registry: CapabilityRegistry,
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
}

impl RunManager {
    /// Create a manager persisting runs under `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>, registry: CapabilityRegistry) -> Result<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;
        Ok(Self {
            root_dir,
            registry,
            runs: RwLock::new(HashMap::new()),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Start a run and return its id. Execution proceeds asynchronously.
    ///
    /// Runs persist their call caches under `<root>/cache` unless the
    /// caller pinned a directory; pass `CacheEnabled::None` to disable
    /// persistence entirely.
    pub fn start(&self, goal: impl Into<String>, mode: Mode, config: Option<ScribeConfig>) -> Result<RunId> {
        let mut config = config.unwrap_or_else(|| ScribeConfig::for_mode(mode));
        config.mode = mode;
        if config.cache.dir.is_none() {
            config.cache.dir = Some(self.root_dir.join("cache"));
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        self.spawn_run(run_id.clone(), goal.into(), config)?;
        Ok(run_id)
    }

    fn spawn_run(&self, run_id: RunId, goal: String, config: ScribeConfig) -> Result<()> {
        let engine = Arc::new(Engine::new(
            run_id.clone(),
            goal,
            config,
            self.registry.clone(),
        )?);
        let dir = self.root_dir.join(&run_id);

        let handle = Arc::new(RunHandle {
            engine: engine.clone(),
            dir: dir.clone(),
            started_at: Utc::now(),
            terminal: RwLock::new(None),
        });
        self.runs.write().insert(run_id.clone(), handle.clone());

        info!(run_id = %run_id, "starting run");
        tokio::spawn(async move {
            let outcome = engine.run_until_done().await;
            let terminal = match &outcome {
                Ok(result) => Terminal {
                    state: RunState::Completed,
                    error_kind: None,
                    error_message: None,
                    failing_node_nid: None,
                    result: Some(result.clone()),
                    at: Utc::now(),
                },
                Err(err) => Terminal {
                    state: RunState::Error,
                    error_kind: Some(err.kind().to_string()),
                    error_message: Some(err.to_string()),
                    failing_node_nid: err.failing_nid().map(|s| s.to_string()),
                    result: None,
                    at: Utc::now(),
                },
            };
            *handle.terminal.write() = Some(terminal);

            if let Err(err) = engine.save_snapshot(&handle.dir) {
                warn!(run_id = %engine.run_id(), error = %err, "failed to write run snapshot");
            }
        });
        Ok(())
    }

    fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownRun(run_id.to_string()))
    }

    /// Status and progress of a run.
    pub fn status(&self, run_id: &str) -> Result<RunStatus> {
        Ok(self.handle(run_id)?.status(run_id))
    }

    /// Final artifact of a completed run.
    ///
    /// Returns `Ok(None)` while the run is still in progress.
    pub fn result(&self, run_id: &str) -> Result<Option<String>> {
        let handle = self.handle(run_id)?;
        let terminal = handle.terminal.read();
        match &*terminal {
            None => Ok(None),
            Some(t) => match (&t.result, &t.error_message) {
                (Some(result), _) => Ok(Some(result.clone())),
                (None, Some(message)) => Err(EngineError::Configuration(message.clone())),
                (None, None) => Err(EngineError::Configuration("run failed".into())),
            },
        }
    }

    /// Point-in-time hierarchical view of a run's graph.
    pub fn graph(&self, run_id: &str) -> Result<GraphView> {
        let handle = self.handle(run_id)?;
        let arena = handle.engine.arena();
        let view = arena.read().hierarchy_view();
        Ok(view)
    }

    /// Current running article text.
    pub fn article(&self, run_id: &str) -> Result<String> {
        Ok(self.handle(run_id)?.engine.article())
    }

    /// Event stream with replay from `from_seq`.
    pub fn subscribe(
        &self,
        run_id: &str,
        from_seq: u64,
    ) -> Result<impl Stream<Item = SubscriberItem> + Send> {
        Ok(self.handle(run_id)?.engine.bus().subscribe(from_seq))
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id)?;
        handle.engine.cancel_flag().store(true, Ordering::Relaxed);
        info!(run_id = %run_id, "cancellation requested");
        Ok(())
    }

    /// All runs: in-memory first, then snapshot directories left by
    /// earlier processes.
    pub fn list_runs(&self) -> Vec<RunStatus> {
        let mut statuses: Vec<RunStatus> = self
            .runs
            .read()
            .iter()
            .map(|(id, handle)| handle.status(id))
            .collect();

        let known: Vec<RunId> = statuses.iter().map(|s| s.run_id.clone()).collect();
        if let Ok(entries) = std::fs::read_dir(&self.root_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if known.iter().any(|id| id == name) || !scribe_store::snapshot_exists(&path) {
                    continue;
                }
                let done = scribe_store::is_done(&path);
                let modified: DateTime<Utc> = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                statuses.push(RunStatus {
                    run_id: name.to_string(),
                    status: if done { RunState::Completed } else { RunState::Error },
                    progress_percent: if done { 100.0 } else { 0.0 },
                    root_status: if done { NodeStatus::Finished } else { NodeStatus::Failed },
                    started_at: modified,
                    updated_at: modified,
                    error_kind: (!done).then(|| "interrupted".to_string()),
                    error_message: None,
                    failing_node_nid: None,
                    usage: TokenUsage::default(),
                });
            }
        }

        statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        statuses
    }

    /// Remove a run and its on-disk snapshot.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        if let Some(handle) = self.runs.write().remove(run_id) {
            handle.engine.cancel_flag().store(true, Ordering::Relaxed);
        }
        let dir = self.root_dir.join(run_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::offline_registry;

    #[tokio::test]
    async fn test_start_status_result_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RunManager::new(dir.path(), offline_registry()).unwrap();

        let run_id = manager
            .start("write a note on bees", Mode::Story, None)
            .unwrap();

        // Poll until terminal.
        let mut waited = 0;
        loop {
            let status = manager.status(&run_id).unwrap();
            if status.status != RunState::Running {
                assert_eq!(status.status, RunState::Completed);
                assert_eq!(status.root_status, NodeStatus::Finished);
                assert!((status.progress_percent - 100.0).abs() < f32::EPSILON);
                break;
            }
            waited += 1;
            assert!(waited < 200, "run did not finish in time");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let result = manager.result(&run_id).unwrap().unwrap();
        assert!(!result.is_empty());

        // The snapshot lands on disk with its completion marker shortly
        // after the terminal state is recorded.
        let run_dir = dir.path().join(&run_id);
        let mut waited = 0;
        while !scribe_store::is_done(&run_dir) {
            waited += 1;
            assert!(waited < 200, "snapshot was never written");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let graph = manager.graph(&run_id).unwrap();
        assert!(graph.count() >= 4);
    }

    #[tokio::test]
    async fn test_unknown_run_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RunManager::new(dir.path(), offline_registry()).unwrap();
        assert!(matches!(
            manager.status("nope"),
            Err(EngineError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_run_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RunManager::new(dir.path(), offline_registry()).unwrap();
        let run_id = manager.start("short note", Mode::Story, None).unwrap();

        loop {
            if manager.status(&run_id).unwrap().status != RunState::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // Wait for the snapshot to land before deleting.
        let run_dir = dir.path().join(&run_id);
        for _ in 0..100 {
            if scribe_store::snapshot_exists(&run_dir) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        manager.delete_run(&run_id).unwrap();
        assert!(!run_dir.exists());
        assert!(manager.status(&run_id).is_err());
    }

    #[tokio::test]
    async fn test_list_runs_includes_disk_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = RunManager::new(dir.path(), offline_registry()).unwrap();
            let run_id = manager.start("archived run", Mode::Story, None).unwrap();
            loop {
                if manager.status(&run_id).unwrap().status != RunState::Running {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            let run_dir = dir.path().join(&run_id);
            for _ in 0..100 {
                if scribe_store::is_done(&run_dir) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        // A fresh manager only sees the snapshot directory.
        let manager = RunManager::new(dir.path(), offline_registry()).unwrap();
        let runs = manager.list_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunState::Completed);
    }
}
