//! Capability contract and registry.
//!
//! A capability is a named external resource (an LLM prompt pipeline, a
//! search backend) invoked by the scheduler through one uniform interface.
//! The registry is the only seam between the kernel and providers: adding a
//! model or search backend means registering another implementation, the
//! scheduler never learns provider specifics.

use crate::error::ErrorClass;
use crate::event::TokenUsage;
use crate::memory::NodeContext;
use crate::node::{ActionName, NodeKind, Passage, TaskType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One subtask requested by a plan.
///
/// `dependencies` holds 0-based indices of earlier descriptors in the same
/// plan; forward references are rejected at validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub task_type: TaskType,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_hint: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<usize>,
    /// Whether the child should be created as a PLAN node and decomposed
    /// further. Subject to the scheduler's depth bound.
    #[serde(default)]
    pub decompose: bool,
}

impl SubtaskSpec {
    pub fn new(task_type: TaskType, goal: impl Into<String>) -> Self {
        Self {
            task_type,
            goal: goal.into(),
            length_hint: None,
            dependencies: Vec::new(),
            decompose: false,
        }
    }

    pub fn with_length_hint(mut self, words: u32) -> Self {
        self.length_hint = Some(words);
        self
    }

    pub fn depends_on(mut self, index: usize) -> Self {
        self.dependencies.push(index);
        self
    }

    /// Mark the child for further decomposition.
    pub fn decomposed(mut self) -> Self {
        self.decompose = true;
        self
    }
}

/// Tagged result of a capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionResult {
    /// Decomposition into subtasks, in order.
    Plan { subtasks: Vec<SubtaskSpec> },
    /// Composed text for the running article.
    Write { text: String },
    /// Retrieved passages.
    Retrieve { passages: Vec<Passage> },
    /// Reasoning conclusion.
    Reason { conclusion: String },
    /// Aggregation of children results.
    Aggregate { text: String },
    /// Failure, classified for the retry machinery.
    Error { kind: ErrorClass, message: String },
}

impl ActionResult {
    pub fn error(kind: ErrorClass, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ActionResult::Error { .. })
    }
}

/// Everything a capability sees when acting on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub run_id: String,
    pub nid: String,
    pub goal: String,
    pub kind: NodeKind,
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_hint: Option<u32>,
    pub layer: u32,
    /// The action being dispatched.
    pub action: ActionName,
    /// 1-based attempt counter. Not part of the fingerprint, so transient
    /// retries reuse the cache slot of the original call.
    pub attempt: u32,
    /// Validation feedback from a rejected earlier attempt, fed back into
    /// the prompt (and therefore into the fingerprint).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Draft under revision, present for reflect actions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
    /// Context assembled by the memory collector.
    pub context: NodeContext,
}

impl CapabilityRequest {
    /// Deterministic prompt text for fingerprinting and simple providers.
    ///
    /// Includes every input that should distinguish one call from another
    /// (goal, context, feedback, draft) and excludes the attempt counter.
    pub fn prompt(&self) -> String {
        let mut prompt = format!(
            "[{}] node {} ({} {})\ngoal: {}",
            self.action, self.nid, self.kind_str(), self.task_type, self.goal
        );
        if let Some(hint) = self.length_hint {
            prompt.push_str(&format!("\nlength_hint: {hint}"));
        }
        if !self.context.goal_trail.is_empty() {
            prompt.push_str("\nancestors:");
            for goal in &self.context.goal_trail {
                prompt.push_str(&format!("\n  - {goal}"));
            }
        }
        for (nid, text) in &self.context.predecessor_results {
            prompt.push_str(&format!("\ndependency {nid}:\n{text}"));
        }
        for (nid, text) in &self.context.child_results {
            prompt.push_str(&format!("\nchild {nid}:\n{text}"));
        }
        if !self.context.sibling_summaries.is_empty() {
            prompt.push_str("\nprior sections:");
            for summary in &self.context.sibling_summaries {
                prompt.push_str(&format!("\n  - {summary}"));
            }
        }
        if !self.context.running_article.is_empty() {
            prompt.push_str(&format!("\narticle so far:\n{}", self.context.running_article));
        }
        if let Some(feedback) = &self.feedback {
            prompt.push_str(&format!("\nprevious attempt rejected: {feedback}"));
        }
        if let Some(draft) = &self.draft {
            prompt.push_str(&format!("\ndraft under revision:\n{draft}"));
        }
        prompt
    }

    /// Auxiliary arguments folded into the fingerprint.
    pub fn fingerprint_args(&self) -> Value {
        serde_json::json!({
            "action": self.action,
            "task_type": self.task_type,
            "layer": self.layer,
        })
    }

    fn kind_str(&self) -> &'static str {
        match self.kind {
            NodeKind::Plan => "PLAN",
            NodeKind::Execute => "EXECUTE",
        }
    }
}

/// Result of an invocation plus optional provider metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReply {
    pub result: ActionResult,
    /// Token accounting, when the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl From<ActionResult> for CapabilityReply {
    fn from(result: ActionResult) -> Self {
        Self {
            result,
            usage: None,
        }
    }
}

/// A named external capability.
///
/// Implementations are expected to be cheap to clone behind an `Arc` and
/// safe to invoke concurrently. Errors are reported in-band through
/// [`ActionResult::Error`], never by panicking.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Stable registry name.
    fn name(&self) -> &str;

    /// Resource class for caching and event taxonomy: `"llm"` or `"search"`.
    fn class(&self) -> &str {
        "llm"
    }

    /// Act on a node.
    async fn invoke(&self, request: CapabilityRequest) -> CapabilityReply;
}

/// Named capabilities registered at startup.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name. Re-registering a name
    /// replaces the previous entry.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    /// Builder-style registration.
    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    /// Resolve a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("names", &self.names())
            .finish()
    }
}
