//! Scheduler and engine: drives the task graph to completion.
//!
//! The engine owns a run's arena behind a single writer lock. Each tick it
//! sweeps readiness and aggregation, picks schedulable candidates in
//! `(layer, topological index, nid)` order, and dispatches their actions
//! onto a `JoinSet` bounded by the in-flight limit. Capability invocations
//! are the only suspension points; every graph mutation and the event
//! emission that describes it happen together under the writer lock, which
//! is what keeps the event stream causally consistent and plan application
//! atomic for observers.

use crate::capability::{
    ActionResult, Capability, CapabilityRegistry, CapabilityReply, CapabilityRequest,
};
use crate::config::ScribeConfig;
use crate::error::{EngineError, ErrorClass, Result};
use crate::event::{
    EventBus, EventPayload, RunFinishReason, RunId, TokenUsage, ToolCallState,
};
use crate::graph::NodeArena;
use crate::memory::Memory;
use crate::node::{action_for, ActionName, NodeId, NodeKind, NodeOutcome, NodeStatus, Passage, TaskType};
use parking_lot::{Mutex, RwLock};
use scribe_store::{CallCache, Fingerprint};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Serialized form of a run, written into snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub config: ScribeConfig,
    pub arena: NodeArena,
}

/// One prepared capability dispatch, built under the graph lock and
/// executed outside it.
struct PreparedDispatch {
    node_id: NodeId,
    nid: String,
    action: ActionName,
    attempt: u32,
    request: CapabilityRequest,
    capability: Arc<dyn Capability>,
    cache: Arc<CallCache>,
    is_tool: bool,
    model: String,
}

/// Result of a dispatch, fed back into the graph under the lock.
struct DispatchOutcome {
    node_id: NodeId,
    action: ActionName,
    attempts: u32,
    verdict: Verdict,
}

enum Verdict {
    Success(CapabilityReply),
    Failure { kind: ErrorClass, message: String },
    Infra(String),
}

enum Tick {
    Finished(String),
    Failed(Box<EngineError>),
    Dispatch { jobs: Vec<PreparedDispatch>, progressed: bool },
}

/// Execution engine for one run.
pub struct Engine {
    run_id: RunId,
    config: ScribeConfig,
    registry: CapabilityRegistry,
    bus: Arc<EventBus>,
    arena: Arc<RwLock<NodeArena>>,
    llm_cache: Arc<CallCache>,
    search_cache: Arc<CallCache>,
    cancel: Arc<AtomicBool>,
    usage: Arc<Mutex<TokenUsage>>,
}

impl Engine {
    /// Create an engine for a fresh root goal.
    pub fn new(
        run_id: impl Into<RunId>,
        goal: impl Into<String>,
        config: ScribeConfig,
        registry: CapabilityRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let run_id = run_id.into();
        let arena = NodeArena::new(goal, TaskType::Composition);
        Self::from_parts(run_id, arena, config, registry)
    }

    /// Reconstruct an engine from a snapshot directory.
    pub fn load(dir: &Path, registry: CapabilityRegistry) -> Result<Self> {
        let (snapshot, _memory, _article): (RunSnapshot, crate::memory::MemoryState, String) =
            scribe_store::load_snapshot(dir)?;
        let mut engine =
            Self::from_parts(snapshot.run_id, snapshot.arena, snapshot.config, registry)?;
        // A node interrupted mid-flight resumes from READY; its capability
        // call did not complete as far as the snapshot is concerned.
        engine.reset_in_flight();
        Ok(engine)
    }

    fn from_parts(
        run_id: RunId,
        arena: NodeArena,
        config: ScribeConfig,
        registry: CapabilityRegistry,
    ) -> Result<Self> {
        let (llm_cache, search_cache) = match &config.cache.dir {
            Some(dir) => {
                let llm = if config.cache.enabled.llm() {
                    CallCache::persistent("llm", dir)?
                } else {
                    CallCache::in_memory("llm")
                };
                let search = if config.cache.enabled.search() {
                    CallCache::persistent("search", dir)?
                } else {
                    CallCache::in_memory("search")
                };
                (llm, search)
            }
            None => (CallCache::in_memory("llm"), CallCache::in_memory("search")),
        };

        Ok(Self {
            bus: Arc::new(EventBus::new(run_id.clone())),
            run_id,
            config,
            registry,
            arena: Arc::new(RwLock::new(arena)),
            llm_cache: Arc::new(llm_cache),
            search_cache: Arc::new(search_cache),
            cancel: Arc::new(AtomicBool::new(false)),
            usage: Arc::new(Mutex::new(TokenUsage::default())),
        })
    }

    fn reset_in_flight(&mut self) {
        let mut arena = self.arena.write();
        let ids: Vec<NodeId> = arena
            .iter()
            .filter(|n| n.status == NodeStatus::Doing)
            .map(|n| n.id)
            .collect();
        for id in ids {
            arena.set_status(id, NodeStatus::Ready);
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn arena(&self) -> Arc<RwLock<NodeArena>> {
        self.arena.clone()
    }

    pub fn config(&self) -> &ScribeConfig {
        &self.config
    }

    /// Cooperative cancellation handle.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Token usage accumulated so far.
    pub fn usage(&self) -> TokenUsage {
        *self.usage.lock()
    }

    /// Current running article, derived from the graph.
    pub fn article(&self) -> String {
        Memory::running_article(&self.arena.read())
    }

    /// Write a snapshot of the run into `dir`.
    pub fn save_snapshot(&self, dir: &Path) -> Result<()> {
        let arena = self.arena.read();
        let snapshot = RunSnapshot {
            run_id: self.run_id.clone(),
            config: self.config.clone(),
            arena: arena.clone(),
        };
        let done = arena
            .get(arena.root())
            .map(|n| n.status.is_terminal())
            .unwrap_or(false);
        let memory = Memory::state(&arena);
        let article = Memory::running_article(&arena);
        drop(arena);
        scribe_store::save_snapshot(dir, &snapshot, &memory, &article, done)?;
        Ok(())
    }

    /// Drive the graph until the root is terminal or the run is cancelled.
    ///
    /// Returns the root's result text on success.
    pub async fn run_until_done(&self) -> Result<String> {
        let goal = {
            let arena = self.arena.read();
            arena
                .get(arena.root())
                .map(|n| n.goal.clone())
                .unwrap_or_default()
        };
        self.bus.emit(EventPayload::RunStarted {
            goal,
            mode: self.config.mode.to_string(),
        });
        info!(run_id = %self.run_id, mode = %self.config.mode, "run started");

        let result = self.drive().await;

        match &result {
            Ok(_) => {
                self.bus.emit(EventPayload::RunFinished {
                    reason: RunFinishReason::Success,
                    error_kind: None,
                    error_message: None,
                    failing_node_nid: None,
                });
                info!(run_id = %self.run_id, "run finished");
            }
            Err(EngineError::Cancelled) => {
                self.bus.emit(EventPayload::RunFinished {
                    reason: RunFinishReason::Cancelled,
                    error_kind: Some("cancelled".into()),
                    error_message: None,
                    failing_node_nid: None,
                });
                info!(run_id = %self.run_id, "run cancelled");
            }
            Err(err) => {
                self.bus.emit(EventPayload::RunFinished {
                    reason: RunFinishReason::Error,
                    error_kind: Some(err.kind().to_string()),
                    error_message: Some(err.to_string()),
                    failing_node_nid: err.failing_nid().map(|s| s.to_string()),
                });
                error!(run_id = %self.run_id, error = %err, "run failed");
            }
        }
        result
    }

    async fn drive(&self) -> Result<String> {
        let mut inflight: JoinSet<DispatchOutcome> = JoinSet::new();
        let mut idle_ticks = 0u32;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                // In-flight calls complete so their results still land in
                // the cache; no new work is picked.
                while let Some(joined) = inflight.join_next().await {
                    if let Ok(outcome) = joined {
                        let _ = self.apply_outcome(outcome);
                    }
                }
                return Err(EngineError::Cancelled);
            }

            let tick = self.tick(inflight.len());
            let (jobs, progressed) = match tick {
                Tick::Finished(text) => return Ok(text),
                Tick::Failed(err) => return Err(*err),
                Tick::Dispatch { jobs, progressed } => (jobs, progressed),
            };

            let dispatched = !jobs.is_empty();
            for job in jobs {
                let bus = self.bus.clone();
                let retry = self.config.retries;
                let timeout_ms = self.config.call.timeout_ms;
                let usage = self.usage.clone();
                inflight.spawn(async move {
                    run_capability(job, bus, retry, timeout_ms, usage).await
                });
            }

            if !inflight.is_empty() {
                idle_ticks = 0;
                if let Some(joined) = inflight.join_next().await {
                    match joined {
                        Ok(outcome) => self.apply_outcome(outcome)?,
                        Err(join_err) => {
                            return Err(EngineError::Configuration(format!(
                                "dispatch task aborted: {join_err}"
                            )));
                        }
                    }
                }
                // Apply any further completions without blocking.
                while let Some(joined) = inflight.try_join_next() {
                    match joined {
                        Ok(outcome) => self.apply_outcome(outcome)?,
                        Err(join_err) => {
                            return Err(EngineError::Configuration(format!(
                                "dispatch task aborted: {join_err}"
                            )));
                        }
                    }
                }
                continue;
            }

            if dispatched || progressed {
                idle_ticks = 0;
                continue;
            }

            // Nothing picked, nothing in flight, nothing changed: one more
            // sweep is allowed to settle cascading flips, then it is a
            // deadlock.
            idle_ticks += 1;
            if idle_ticks >= 2 {
                let nid = self
                    .arena
                    .read()
                    .first_blocked()
                    .map(|n| n.nid.to_string())
                    .unwrap_or_else(|| "0".to_string());
                return Err(EngineError::Deadlock { nid });
            }
        }
    }

    /// One scheduler iteration under the writer lock: sweeps, terminal
    /// check, candidate selection, and DOING transitions.
    fn tick(&self, in_flight: usize) -> Tick {
        let mut arena = self.arena.write();
        let mut progressed = false;

        for change in arena.advance_readiness() {
            progressed = true;
            self.emit_status_change(&arena, change.id, change.old, change.new);
        }
        for change in arena.advance_aggregation() {
            progressed = true;
            self.emit_status_change(&arena, change.id, change.old, change.new);
        }

        let root = arena.root();
        if let Some(node) = arena.get(root) {
            match node.status {
                NodeStatus::Finished => return Tick::Finished(node.result_text()),
                NodeStatus::Failed => {
                    let (class, message, attempts) = match &node.outcome {
                        Some(NodeOutcome::Failure { kind, message, attempts }) => {
                            (*kind, message.clone(), *attempts)
                        }
                        _ => (ErrorClass::Fatal, "root failed".to_string(), 0),
                    };
                    return Tick::Failed(Box::new(EngineError::node_failed(
                        node.nid.to_string(),
                        class,
                        message,
                        attempts,
                    )));
                }
                _ => {}
            }
        }

        let capacity = self
            .config
            .scheduler
            .in_flight_limit
            .saturating_sub(in_flight);
        let mut jobs = Vec::new();
        if capacity > 0 {
            let candidates = arena.candidates();
            for id in candidates.into_iter().take(capacity) {
                match self.prepare_dispatch(&mut arena, id) {
                    Ok(Some(job)) => {
                        progressed = true;
                        jobs.push(job);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // Misconfiguration (unknown capability): the node
                        // fails immediately, no retry can help.
                        progressed = true;
                        let nid = arena
                            .get(id)
                            .map(|n| n.nid.to_string())
                            .unwrap_or_default();
                        warn!(nid = %nid, error = %err, "failing node at dispatch");
                        self.fail_node(&mut arena, id, ErrorClass::Fatal, err.to_string(), 0);
                    }
                }
            }
        }

        Tick::Dispatch { jobs, progressed }
    }

    /// Build the dispatch for one candidate and mark it DOING.
    fn prepare_dispatch(
        &self,
        arena: &mut NodeArena,
        id: NodeId,
    ) -> Result<Option<PreparedDispatch>> {
        let (kind, task_type, status, layer) = {
            let Some(node) = arena.get(id) else { return Ok(None) };
            (node.kind, node.task_type, node.status, node.layer)
        };

        let mut kind = kind;
        let mut action = match action_for(kind, task_type, status) {
            Some(action) => action,
            None => return Ok(None),
        };

        // Depth policy: a PLAN node at the depth bound may not plan; it is
        // demoted and retried as a direct execution.
        if action == ActionName::Plan && layer >= self.config.scheduler.max_layers {
            warn!(
                nid = %arena.get(id).map(|n| n.nid.to_string()).unwrap_or_default(),
                layer,
                max_layers = self.config.scheduler.max_layers,
                "depth bound reached; demoting to direct execution"
            );
            kind = NodeKind::Execute;
            if let Some(node) = arena.get_mut(id) {
                node.kind = NodeKind::Execute;
            }
            action = match action_for(kind, task_type, status) {
                Some(action) => action,
                None => return Ok(None),
            };
        }

        let model = self.model_for(action, task_type);
        let capability = self
            .registry
            .get(&model)
            .ok_or_else(|| EngineError::UnknownCapability(model.clone()))?;

        let context = Memory::collect(arena, id, &self.config, action);
        let Some(node) = arena.get(id) else { return Ok(None) };
        let attempt = node.attempts + 1;
        let request = CapabilityRequest {
            run_id: self.run_id.clone(),
            nid: node.nid.to_string(),
            goal: node.goal.clone(),
            kind,
            task_type,
            length_hint: node.length_hint,
            layer,
            action,
            attempt,
            feedback: node.feedback.clone(),
            draft: (action == ActionName::Reflect).then(|| node.result_text()),
            context,
        };

        let is_tool = capability.class() == "search";
        let cache = if is_tool {
            self.search_cache.clone()
        } else {
            self.llm_cache.clone()
        };

        let nid = node.nid.to_string();
        let old = node.status;
        arena.set_status(id, NodeStatus::Doing);
        self.emit_status_change(arena, id, old, NodeStatus::Doing);
        self.bus.emit(EventPayload::StepStarted {
            nid: nid.clone(),
            action,
        });
        debug!(nid = %nid, action = %action, attempt, "dispatching");

        Ok(Some(PreparedDispatch {
            node_id: id,
            nid,
            action,
            attempt,
            request,
            capability,
            cache,
            is_tool,
            model,
        }))
    }

    fn model_for(&self, action: ActionName, task_type: TaskType) -> String {
        match action {
            ActionName::Plan => self.config.models.plan.clone(),
            ActionName::Aggregate => self.config.models.aggregate.clone(),
            ActionName::Retrieve => match (&self.config.search_backend, task_type) {
                (Some(backend), TaskType::Retrieval) => backend.clone(),
                _ => self.config.models.execute.clone(),
            },
            ActionName::Write | ActionName::Reason | ActionName::Reflect => {
                self.config.models.execute.clone()
            }
        }
    }

    /// Fold a completed dispatch back into the graph.
    fn apply_outcome(&self, outcome: DispatchOutcome) -> Result<()> {
        let mut arena = self.arena.write();
        let DispatchOutcome {
            node_id,
            action,
            attempts,
            verdict,
        } = outcome;

        match verdict {
            Verdict::Success(reply) => {
                self.apply_result(&mut arena, node_id, action, attempts, reply.result)
            }
            Verdict::Failure { kind, message } => {
                self.apply_failure(&mut arena, node_id, action, attempts, kind, message);
                Ok(())
            }
            Verdict::Infra(message) => {
                self.fail_node(&mut arena, node_id, ErrorClass::Fatal, message, attempts);
                self.emit_step_finished(&arena, node_id, action);
                Ok(())
            }
        }
    }

    fn apply_result(
        &self,
        arena: &mut NodeArena,
        id: NodeId,
        action: ActionName,
        attempts: u32,
        result: ActionResult,
    ) -> Result<()> {
        match (action, result) {
            (ActionName::Plan, ActionResult::Plan { subtasks }) => {
                let nid = arena
                    .get(id)
                    .map(|n| n.nid.to_string())
                    .unwrap_or_default();
                self.bus.emit(EventPayload::PlanReceived {
                    nid: nid.clone(),
                    plan: serde_json::to_value(&subtasks)?,
                });

                match arena.apply_plan(id, &subtasks, self.config.scheduler.max_layers) {
                    Ok(application) => {
                        for &child in &application.added {
                            if let Some(node) = arena.get(child) {
                                self.bus.emit(EventPayload::NodeCreated {
                                    nid: node.nid.to_string(),
                                    kind: node.kind,
                                    task_type: node.task_type,
                                    goal: node.goal.clone(),
                                });
                                self.bus.emit(EventPayload::NodeAdded {
                                    parent_nid: nid.clone(),
                                    nid: node.nid.to_string(),
                                });
                            }
                        }
                        for &(from, to) in &application.edges {
                            self.bus.emit(EventPayload::EdgeAdded {
                                from_nid: arena
                                    .get(from)
                                    .map(|n| n.nid.to_string())
                                    .unwrap_or_default(),
                                to_nid: arena
                                    .get(to)
                                    .map(|n| n.nid.to_string())
                                    .unwrap_or_default(),
                            });
                        }
                        self.bus.emit(EventPayload::InnerGraphBuilt {
                            nid: nid.clone(),
                            nodes: application.added.len(),
                            edges: application.edges.len(),
                        });

                        if let Some(node) = arena.get_mut(id) {
                            node.feedback = None;
                            node.attempts = 0;
                        }
                        let old = arena.set_status(id, NodeStatus::PlanDone);
                        if let Some(old) = old {
                            self.emit_status_change(arena, id, old, NodeStatus::PlanDone);
                        }
                        self.emit_step_finished(arena, id, action);
                        Ok(())
                    }
                    Err(EngineError::InvalidPlan(reason)) => {
                        self.retry_validation(arena, id, action, attempts, reason);
                        Ok(())
                    }
                    Err(other) => Err(other),
                }
            }

            // A planner may answer atomically instead of decomposing; the
            // node then behaves as a leaf.
            (ActionName::Plan, ActionResult::Write { text }) => {
                if let Some(node) = arena.get_mut(id) {
                    node.kind = NodeKind::Execute;
                }
                self.finish_or_reflect(arena, id, action, NodeOutcome::Text { text })
            }
            (ActionName::Plan, ActionResult::Reason { conclusion }) => {
                if let Some(node) = arena.get_mut(id) {
                    node.kind = NodeKind::Execute;
                }
                self.finish_or_reflect(arena, id, action, NodeOutcome::Conclusion { conclusion })
            }

            (ActionName::Write, ActionResult::Write { text })
            | (ActionName::Write, ActionResult::Aggregate { text }) => {
                self.finish_or_reflect(arena, id, action, NodeOutcome::Text { text })
            }
            (ActionName::Reason, ActionResult::Reason { conclusion }) => {
                self.finish_or_reflect(arena, id, action, NodeOutcome::Conclusion { conclusion })
            }
            (ActionName::Reason, ActionResult::Write { text }) => {
                self.finish_or_reflect(arena, id, action, NodeOutcome::Conclusion { conclusion: text })
            }
            (ActionName::Retrieve, ActionResult::Retrieve { passages }) => {
                self.finish_or_reflect(arena, id, action, NodeOutcome::Passages { passages })
            }
            (ActionName::Retrieve, ActionResult::Write { text }) => {
                self.finish_or_reflect(
                    arena,
                    id,
                    action,
                    NodeOutcome::Passages { passages: vec![Passage::new(text)] },
                )
            }

            (ActionName::Aggregate, ActionResult::Aggregate { text })
            | (ActionName::Aggregate, ActionResult::Write { text }) => {
                self.finish_node(arena, id, action, NodeOutcome::Text { text })
            }

            // Reflection replaces the draft when it produces text and
            // otherwise keeps it.
            (ActionName::Reflect, ActionResult::Write { text })
            | (ActionName::Reflect, ActionResult::Aggregate { text }) => {
                self.replace_and_finish(arena, id, action, NodeOutcome::Text { text })
            }
            (ActionName::Reflect, ActionResult::Reason { conclusion }) => {
                self.replace_and_finish(arena, id, action, NodeOutcome::Conclusion { conclusion })
            }
            (ActionName::Reflect, _) => {
                let draft = arena.get(id).and_then(|n| n.outcome.clone());
                match draft {
                    Some(outcome) => self.replace_and_finish(arena, id, action, outcome),
                    None => {
                        self.fail_node(
                            arena,
                            id,
                            ErrorClass::Fatal,
                            "reflection had no draft to keep".to_string(),
                            attempts,
                        );
                        self.emit_step_finished(arena, id, action);
                        Ok(())
                    }
                }
            }

            (_, ActionResult::Error { kind, message }) => {
                self.apply_failure(arena, id, action, attempts, kind, message);
                Ok(())
            }

            // A result variant the action cannot absorb is a validation
            // failure, retried with feedback like any malformed plan.
            (action, other) => {
                let reason = format!(
                    "capability returned {} for a {} action",
                    variant_name(&other),
                    action
                );
                self.retry_validation(arena, id, action, attempts, reason);
                Ok(())
            }
        }
    }

    fn apply_failure(
        &self,
        arena: &mut NodeArena,
        id: NodeId,
        action: ActionName,
        attempts: u32,
        kind: ErrorClass,
        message: String,
    ) {
        // A failed reflection keeps the draft instead of discarding the
        // work that produced it.
        if action == ActionName::Reflect {
            let draft = arena.get(id).and_then(|n| n.outcome.clone());
            if let Some(outcome) = draft {
                warn!(
                    nid = %arena.get(id).map(|n| n.nid.to_string()).unwrap_or_default(),
                    kind = %kind,
                    message = %message,
                    "reflection failed; keeping draft"
                );
                let _ = self.replace_and_finish(arena, id, action, outcome);
                return;
            }
        }
        match kind {
            ErrorClass::Validation => {
                self.retry_validation(arena, id, action, attempts, message);
            }
            ErrorClass::Policy => {
                // Convert to a direct execution and retry once.
                let already_execute = arena
                    .get(id)
                    .map(|n| n.kind == NodeKind::Execute)
                    .unwrap_or(true);
                if already_execute {
                    self.fail_node(arena, id, kind, message, attempts);
                    self.emit_step_finished(arena, id, action);
                } else {
                    if let Some(node) = arena.get_mut(id) {
                        node.kind = NodeKind::Execute;
                        node.attempts = self.config.retries.max.saturating_sub(1);
                    }
                    let old = arena.set_status(id, NodeStatus::Ready);
                    if let Some(old) = old {
                        self.emit_status_change(arena, id, old, NodeStatus::Ready);
                    }
                    self.emit_step_finished(arena, id, action);
                }
            }
            ErrorClass::Transient | ErrorClass::Fatal => {
                // Transient failures only reach here with the retry budget
                // exhausted inside the dispatch task.
                self.fail_node(arena, id, kind, message, attempts);
                self.emit_step_finished(arena, id, action);
            }
        }
    }

    /// Put a node back to READY with validation feedback, or fail it when
    /// the budget is exhausted.
    fn retry_validation(
        &self,
        arena: &mut NodeArena,
        id: NodeId,
        action: ActionName,
        attempts: u32,
        reason: String,
    ) {
        let budget = self.config.retries.max;
        if attempts >= budget {
            self.fail_node(arena, id, ErrorClass::Validation, reason, attempts);
            self.emit_step_finished(arena, id, action);
            return;
        }
        if let Some(node) = arena.get_mut(id) {
            node.attempts = attempts;
            node.feedback = Some(reason.clone());
        }
        let old = arena.set_status(id, NodeStatus::Ready);
        if let Some(old) = old {
            self.emit_status_change(arena, id, old, NodeStatus::Ready);
        }
        self.emit_step_finished(arena, id, action);
        debug!(
            nid = %arena.get(id).map(|n| n.nid.to_string()).unwrap_or_default(),
            attempts,
            reason = %reason,
            "validation failed; retrying with feedback"
        );
    }

    /// Store an execution result, routing through reflection when enabled.
    fn finish_or_reflect(
        &self,
        arena: &mut NodeArena,
        id: NodeId,
        action: ActionName,
        outcome: NodeOutcome,
    ) -> Result<()> {
        if self.config.post_reflect.enabled && action != ActionName::Reflect {
            arena.record_outcome(id, outcome, NodeStatus::NeedPostReflect)?;
            self.emit_status_change(arena, id, NodeStatus::Doing, NodeStatus::NeedPostReflect);
            self.emit_step_finished(arena, id, action);
            return Ok(());
        }
        self.finish_node(arena, id, action, outcome)
    }

    fn finish_node(
        &self,
        arena: &mut NodeArena,
        id: NodeId,
        action: ActionName,
        outcome: NodeOutcome,
    ) -> Result<()> {
        arena.record_outcome(id, outcome, NodeStatus::Finished)?;
        if let Some(node) = arena.get_mut(id) {
            node.feedback = None;
        }
        self.emit_status_change(arena, id, NodeStatus::Doing, NodeStatus::Finished);
        let nid = arena
            .get(id)
            .map(|n| n.nid.to_string())
            .unwrap_or_default();
        self.bus.emit(EventPayload::NodeResultAvailable { nid });
        self.emit_step_finished(arena, id, action);
        Ok(())
    }

    /// Reflection path: the draft is replaced rather than write-once.
    fn replace_and_finish(
        &self,
        arena: &mut NodeArena,
        id: NodeId,
        action: ActionName,
        outcome: NodeOutcome,
    ) -> Result<()> {
        if let Some(node) = arena.get_mut(id) {
            node.outcome = Some(outcome);
            node.status = NodeStatus::Finished;
            node.feedback = None;
        }
        self.emit_status_change(arena, id, NodeStatus::Doing, NodeStatus::Finished);
        let nid = arena
            .get(id)
            .map(|n| n.nid.to_string())
            .unwrap_or_default();
        self.bus.emit(EventPayload::NodeResultAvailable { nid });
        self.emit_step_finished(arena, id, action);
        Ok(())
    }

    fn fail_node(
        &self,
        arena: &mut NodeArena,
        id: NodeId,
        kind: ErrorClass,
        message: String,
        attempts: u32,
    ) {
        let old = arena.get(id).map(|n| n.status);
        if let Some(node) = arena.get_mut(id) {
            node.outcome = Some(NodeOutcome::Failure {
                kind,
                message: message.clone(),
                attempts,
            });
            node.status = NodeStatus::Failed;
        }
        if let Some(old) = old {
            self.emit_status_change(arena, id, old, NodeStatus::Failed);
        }
        warn!(
            nid = %arena.get(id).map(|n| n.nid.to_string()).unwrap_or_default(),
            kind = %kind,
            attempts,
            message = %message,
            "node failed"
        );
    }

    fn emit_status_change(
        &self,
        arena: &NodeArena,
        id: NodeId,
        old: NodeStatus,
        new: NodeStatus,
    ) {
        if old == new {
            return;
        }
        let nid = arena
            .get(id)
            .map(|n| n.nid.to_string())
            .unwrap_or_default();
        self.bus.emit(EventPayload::NodeStatusChanged { nid, old, new });
    }

    fn emit_step_finished(&self, arena: &NodeArena, id: NodeId, action: ActionName) {
        if let Some(node) = arena.get(id) {
            self.bus.emit(EventPayload::StepFinished {
                nid: node.nid.to_string(),
                action,
                status: node.status,
            });
        }
    }
}

/// Execute one dispatch outside the graph lock: cache lookup with
/// single-flight, per-call timeout, and transient retries with exponential
/// backoff. Validation and policy failures return immediately; the
/// scheduler decides how to retry those.
async fn run_capability(
    job: PreparedDispatch,
    bus: Arc<EventBus>,
    retry: crate::config::RetryConfig,
    timeout_ms: u64,
    usage: Arc<Mutex<TokenUsage>>,
) -> DispatchOutcome {
    let fp = Fingerprint::compute(
        job.capability.class(),
        &job.model,
        &job.request.prompt(),
        &job.request.fingerprint_args(),
    );

    let mut attempt = job.attempt;
    let max_attempts = retry.max.max(1);
    loop {
        let call_id = uuid::Uuid::new_v4().to_string();
        if job.is_tool {
            bus.emit(EventPayload::ToolInvoked {
                call_id: call_id.clone(),
                nid: job.nid.clone(),
                api: job.model.clone(),
            });
        } else {
            bus.emit(EventPayload::LlmCallStarted {
                call_id: call_id.clone(),
                nid: job.nid.clone(),
                model: job.model.clone(),
            });
        }

        let start = Instant::now();
        let capability = job.capability.clone();
        let request = job.request.clone();
        let outcome = job
            .cache
            .get_or_compute(&fp, || async move {
                let invocation = capability.invoke(request);
                let reply = match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    invocation,
                )
                .await
                {
                    Ok(reply) => reply,
                    Err(_) => CapabilityReply::from(ActionResult::error(
                        ErrorClass::Transient,
                        format!("capability call timed out after {timeout_ms}ms"),
                    )),
                };
                let value = match serde_json::to_value(&reply) {
                    Ok(value) => value,
                    Err(err) => {
                        return Err(serde_json::json!({
                            "result": {
                                "action": "error",
                                "kind": "fatal",
                                "message": format!("unserializable capability reply: {err}"),
                            }
                        }))
                    }
                };
                if reply.result.is_error() {
                    Err(value)
                } else {
                    Ok(value)
                }
            })
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let reply = match outcome {
            Ok(Ok(value)) | Ok(Err(value)) => match serde_json::from_value::<CapabilityReply>(value) {
                Ok(reply) => reply,
                Err(err) => CapabilityReply::from(ActionResult::error(
                    ErrorClass::Fatal,
                    format!("malformed cached reply: {err}"),
                )),
            },
            Err(store_err) => {
                emit_call_finished(&bus, &job, &call_id, duration_ms, Some(store_err.to_string()), None);
                return DispatchOutcome {
                    node_id: job.node_id,
                    action: job.action,
                    attempts: attempt,
                    verdict: Verdict::Infra(store_err.to_string()),
                };
            }
        };

        match &reply.result {
            ActionResult::Error { kind, message } => {
                emit_call_finished(&bus, &job, &call_id, duration_ms, Some(message.clone()), None);
                if *kind == ErrorClass::Transient && attempt < max_attempts {
                    let delay = backoff_delay(retry.backoff_ms, attempt);
                    debug!(
                        nid = %job.nid,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return DispatchOutcome {
                    node_id: job.node_id,
                    action: job.action,
                    attempts: attempt,
                    verdict: Verdict::Failure {
                        kind: *kind,
                        message: message.clone(),
                    },
                };
            }
            _ => {
                if let Some(call_usage) = reply.usage {
                    let mut total = usage.lock();
                    total.prompt_tokens += call_usage.prompt_tokens;
                    total.completion_tokens += call_usage.completion_tokens;
                }
                emit_call_finished(&bus, &job, &call_id, duration_ms, None, reply.usage);
                return DispatchOutcome {
                    node_id: job.node_id,
                    action: job.action,
                    attempts: attempt,
                    verdict: Verdict::Success(reply),
                };
            }
        }
    }
}

fn emit_call_finished(
    bus: &EventBus,
    job: &PreparedDispatch,
    call_id: &str,
    duration_ms: u64,
    error: Option<String>,
    usage: Option<TokenUsage>,
) {
    if job.is_tool {
        bus.emit(EventPayload::ToolReturned {
            call_id: call_id.to_string(),
            nid: job.nid.clone(),
            api: job.model.clone(),
            state: if error.is_none() {
                ToolCallState::Success
            } else {
                ToolCallState::Error
            },
            duration_ms,
        });
    } else {
        bus.emit(EventPayload::LlmCallCompleted {
            call_id: call_id.to_string(),
            nid: job.nid.clone(),
            model: job.model.clone(),
            usage,
            duration_ms,
            error,
        });
    }
}

/// Exponential backoff doubled per attempt, with up to 25% jitter.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    use rand::Rng;
    let exponent = attempt.saturating_sub(1).min(16);
    let base = base_ms.saturating_mul(1u64 << exponent);
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    Duration::from_millis((base as f64 * (1.0 + jitter)) as u64)
}

fn variant_name(result: &ActionResult) -> &'static str {
    match result {
        ActionResult::Plan { .. } => "plan",
        ActionResult::Write { .. } => "write",
        ActionResult::Retrieve { .. } => "retrieve",
        ActionResult::Reason { .. } => "reason",
        ActionResult::Aggregate { .. } => "aggregate",
        ActionResult::Error { .. } => "error",
    }
}
