//! Node model: identifiers, task classification, and the per-node state
//! machine.
//!
//! Nodes are arena-allocated and addressed by [`NodeId`]; containment and
//! dependency relations hold ids, never references, which keeps the graph
//! serializable and free of reference cycles.

use crate::error::ErrorClass;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Arena index of a node, stable for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-readable hierarchical path, e.g. `1.2.3`.
///
/// The root is `0`. Children take `parent.N` with a 1-based index in plan
/// order. Ordering is segment-wise numeric, so `1.2` < `1.10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nid(String);

impl Nid {
    /// The root path.
    pub fn root() -> Self {
        Self("0".to_string())
    }

    /// Child path with a 1-based index.
    pub fn child(&self, index: usize) -> Self {
        Self(format!("{}.{}", self.0, index))
    }

    /// Numeric segments of the path.
    pub fn segments(&self) -> Vec<u64> {
        self.0
            .split('.')
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Nid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Nid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(&other.segments())
    }
}

/// Whether a node decomposes further or produces output directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeKind {
    /// Owns an inner graph of children.
    Plan,
    /// Leaf; invokes a capability and stores the result.
    Execute,
}

/// The kind of work a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    /// Produces prose that joins the running article.
    Composition,
    /// Gathers passages from a search backend.
    Retrieval,
    /// Draws a conclusion consumed by dependents.
    Reasoning,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Composition => "COMPOSITION",
            TaskType::Retrieval => "RETRIEVAL",
            TaskType::Reasoning => "REASONING",
        };
        write!(f, "{}", name)
    }
}

/// Per-node finite state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Predecessors unfinished or parent does not admit work yet.
    NotReady,
    /// All predecessors finished; next action can be dispatched.
    Ready,
    /// A capability invocation is in flight.
    Doing,
    /// PLAN node whose plan was accepted; waiting on children.
    PlanDone,
    /// PLAN node whose children all finished; aggregation pending.
    NeedUpdate,
    /// Execution produced a draft that needs a verification pass.
    NeedPostReflect,
    /// Terminal success.
    Finished,
    /// Terminal failure.
    Failed,
}

impl NodeStatus {
    /// Whether this status ends the node's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Finished | NodeStatus::Failed)
    }

    /// Whether the scheduler may pick a node in this status.
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self,
            NodeStatus::Ready | NodeStatus::NeedUpdate | NodeStatus::NeedPostReflect
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::NotReady => "NOT_READY",
            NodeStatus::Ready => "READY",
            NodeStatus::Doing => "DOING",
            NodeStatus::PlanDone => "PLAN_DONE",
            NodeStatus::NeedUpdate => "NEED_UPDATE",
            NodeStatus::NeedPostReflect => "NEED_POST_REFLECT",
            NodeStatus::Finished => "FINISHED",
            NodeStatus::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// The capability invocation chosen for a node on a scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionName {
    Plan,
    Write,
    Reason,
    Retrieve,
    Aggregate,
    Reflect,
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionName::Plan => "plan",
            ActionName::Write => "write",
            ActionName::Reason => "reason",
            ActionName::Retrieve => "retrieve",
            ActionName::Aggregate => "aggregate",
            ActionName::Reflect => "reflect",
        };
        write!(f, "{}", name)
    }
}

/// Deterministic action table over `(kind, task_type, status)`.
///
/// Returns `None` for statuses that carry no action (terminal, waiting, or
/// in flight).
pub fn action_for(kind: NodeKind, task_type: TaskType, status: NodeStatus) -> Option<ActionName> {
    match (kind, status) {
        (NodeKind::Plan, NodeStatus::Ready) => Some(ActionName::Plan),
        (NodeKind::Plan, NodeStatus::NeedUpdate) => Some(ActionName::Aggregate),
        (NodeKind::Execute, NodeStatus::Ready) => Some(match task_type {
            TaskType::Composition => ActionName::Write,
            TaskType::Retrieval => ActionName::Retrieve,
            TaskType::Reasoning => ActionName::Reason,
        }),
        (_, NodeStatus::NeedPostReflect) => Some(ActionName::Reflect),
        _ => None,
    }
}

/// A retrieved passage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    /// Source title, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Source locator, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Passage text.
    pub content: String,
}

impl Passage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            title: None,
            url: None,
            content: content.into(),
        }
    }
}

/// Structured output of a finished or failed node.
///
/// Externally tagged so both the JSON and the binary snapshot tier can
/// round-trip it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Composed or aggregated text.
    Text { text: String },
    /// Retrieved passages.
    Passages { passages: Vec<Passage> },
    /// Reasoning conclusion.
    Conclusion { conclusion: String },
    /// Terminal error record.
    Failure {
        kind: ErrorClass,
        message: String,
        attempts: u32,
    },
}

impl NodeOutcome {
    /// Flat text rendering used by the context collector and aggregation.
    pub fn as_text(&self) -> String {
        match self {
            NodeOutcome::Text { text } => text.clone(),
            NodeOutcome::Conclusion { conclusion } => conclusion.clone(),
            NodeOutcome::Passages { passages } => passages
                .iter()
                .map(|p| p.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            NodeOutcome::Failure { kind, message, .. } => {
                format!("[failed: {} - {}]", kind, message)
            }
        }
    }

    /// Whether this outcome represents a failure record.
    pub fn is_failure(&self) -> bool {
        matches!(self, NodeOutcome::Failure { .. })
    }
}

/// The unit of work in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Arena id, unique across the run.
    pub id: NodeId,
    /// Hierarchical path, stable for the node's lifetime.
    pub nid: Nid,
    pub kind: NodeKind,
    pub task_type: TaskType,
    /// Natural-language objective.
    pub goal: String,
    /// Target size for composition nodes, in words.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_hint: Option<u32>,
    /// Depth from root (0 at root).
    pub layer: u32,
    pub status: NodeStatus,
    /// Write-once once FINISHED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<NodeOutcome>,
    /// Containment parent; root has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer: Option<NodeId>,
    /// Sibling dependencies that must finish first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predecessors: Vec<NodeId>,
    /// Scheduler-level attempts consumed (validation retries, reflect).
    #[serde(default)]
    pub attempts: u32,
    /// Validation feedback carried into the next planning attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Node {
    /// Create a node in NOT_READY with no outcome.
    pub fn new(
        id: NodeId,
        nid: Nid,
        kind: NodeKind,
        task_type: TaskType,
        goal: impl Into<String>,
        layer: u32,
        outer: Option<NodeId>,
    ) -> Self {
        Self {
            id,
            nid,
            kind,
            task_type,
            goal: goal.into(),
            length_hint: None,
            layer,
            status: NodeStatus::NotReady,
            outcome: None,
            outer,
            predecessors: Vec::new(),
            attempts: 0,
            feedback: None,
        }
    }

    /// Flat text of the outcome, empty when unfinished.
    pub fn result_text(&self) -> String {
        self.outcome.as_ref().map(|o| o.as_text()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nid_child_paths() {
        let root = Nid::root();
        assert_eq!(root.as_str(), "0");
        let child = root.child(1);
        assert_eq!(child.as_str(), "0.1");
        assert_eq!(child.child(3).as_str(), "0.1.3");
    }

    #[test]
    fn test_nid_numeric_ordering() {
        let a = Nid::root().child(2);
        let b = Nid::root().child(10);
        // Lexicographic would put "0.10" before "0.2".
        assert!(a < b);

        let deep = Nid::root().child(1).child(1);
        let shallow = Nid::root().child(2);
        assert!(deep < shallow);
    }

    #[test]
    fn test_action_table() {
        use ActionName::*;
        assert_eq!(
            action_for(NodeKind::Plan, TaskType::Composition, NodeStatus::Ready),
            Some(Plan)
        );
        assert_eq!(
            action_for(NodeKind::Plan, TaskType::Composition, NodeStatus::NeedUpdate),
            Some(Aggregate)
        );
        assert_eq!(
            action_for(NodeKind::Execute, TaskType::Composition, NodeStatus::Ready),
            Some(Write)
        );
        assert_eq!(
            action_for(NodeKind::Execute, TaskType::Retrieval, NodeStatus::Ready),
            Some(Retrieve)
        );
        assert_eq!(
            action_for(NodeKind::Execute, TaskType::Reasoning, NodeStatus::Ready),
            Some(Reason)
        );
        assert_eq!(
            action_for(
                NodeKind::Execute,
                TaskType::Composition,
                NodeStatus::NeedPostReflect
            ),
            Some(Reflect)
        );
        assert_eq!(
            action_for(NodeKind::Execute, TaskType::Composition, NodeStatus::Doing),
            None
        );
        assert_eq!(
            action_for(NodeKind::Plan, TaskType::Composition, NodeStatus::Finished),
            None
        );
    }

    #[test]
    fn test_status_predicates() {
        assert!(NodeStatus::Finished.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(!NodeStatus::Doing.is_terminal());
        assert!(NodeStatus::Ready.is_schedulable());
        assert!(NodeStatus::NeedUpdate.is_schedulable());
        assert!(!NodeStatus::NotReady.is_schedulable());
    }

    #[test]
    fn test_outcome_text_rendering() {
        let outcome = NodeOutcome::Passages {
            passages: vec![Passage::new("first"), Passage::new("second")],
        };
        assert_eq!(outcome.as_text(), "first\n\nsecond");

        let outcome = NodeOutcome::Text {
            text: "The cat sat.".into(),
        };
        assert_eq!(outcome.as_text(), "The cat sat.");
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&NodeStatus::NeedPostReflect).unwrap();
        assert_eq!(json, "\"NEED_POST_REFLECT\"");
        let json = serde_json::to_string(&NodeStatus::PlanDone).unwrap();
        assert_eq!(json, "\"PLAN_DONE\"");
    }
}
