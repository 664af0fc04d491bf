//! Task graph: containment tree plus per-plan dependency DAGs.
//!
//! The graph is two-dimensional. The outer dimension is a containment tree
//! rooted at the run's root node; the inner dimension is, for every PLAN
//! node, a DAG over its children expressing lateral dependencies. All
//! relations hold [`NodeId`]s into one arena, which keeps the structure
//! serializable and makes snapshots a plain serde round-trip.
//!
//! Structural invariants enforced here:
//! - containment is a tree (every non-root node has exactly one parent
//!   whose inner graph lists it),
//! - every inner dependency relation is acyclic,
//! - predecessors are always siblings,
//! - a finished node's outcome is write-once.

use crate::capability::SubtaskSpec;
use crate::error::{EngineError, Result};
use crate::node::{Nid, Node, NodeId, NodeKind, NodeOutcome, NodeStatus, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Dependency structure owned by one PLAN node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InnerGraph {
    /// Children in plan order.
    pub members: Vec<NodeId>,
    /// Dependency edges `(prerequisite, dependent)`.
    pub edges: Vec<(NodeId, NodeId)>,
    /// Topological order, materialized when the plan is accepted.
    pub topo: Vec<NodeId>,
}

/// Record of one accepted plan, used by the engine to emit events.
#[derive(Debug, Clone)]
pub struct PlanApplication {
    /// Created children, in plan order.
    pub added: Vec<NodeId>,
    /// Added dependency edges.
    pub edges: Vec<(NodeId, NodeId)>,
}

/// A status flip observed during a readiness or aggregation sweep.
#[derive(Debug, Clone, Copy)]
pub struct StatusChange {
    pub id: NodeId,
    pub old: NodeStatus,
    pub new: NodeStatus,
}

/// Arena owning every node of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeArena {
    nodes: Vec<Node>,
    inner: HashMap<u64, InnerGraph>,
    root: NodeId,
}

impl NodeArena {
    /// Create an arena holding only the root node.
    ///
    /// The root starts as a PLAN node in NOT_READY; the first readiness
    /// sweep promotes it.
    pub fn new(goal: impl Into<String>, task_type: TaskType) -> Self {
        let root = NodeId(0);
        let node = Node::new(root, Nid::root(), NodeKind::Plan, task_type, goal, 0, None);
        Self {
            nodes: vec![node],
            inner: HashMap::new(),
            root,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize)
    }

    /// Iterate over all nodes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Inner graph of a PLAN node, if a plan was accepted.
    pub fn inner_graph(&self, id: NodeId) -> Option<&InnerGraph> {
        self.inner.get(&id.0)
    }

    /// Position of a node in its parent's topological order; 0 for root.
    pub fn topo_index(&self, id: NodeId) -> usize {
        let Some(node) = self.get(id) else { return 0 };
        let Some(outer) = node.outer else { return 0 };
        self.inner
            .get(&outer.0)
            .and_then(|g| g.topo.iter().position(|&m| m == id))
            .unwrap_or(0)
    }

    /// Validate a plan payload against the plan invariants.
    ///
    /// Rejects empty plans and dependency indices that are out of range or
    /// not strictly earlier than the descriptor they belong to.
    pub fn validate_plan(specs: &[SubtaskSpec]) -> Result<()> {
        if specs.is_empty() {
            return Err(EngineError::InvalidPlan(
                "plan must contain at least one subtask".into(),
            ));
        }
        for (index, spec) in specs.iter().enumerate() {
            if spec.goal.trim().is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "subtask {index} has an empty goal"
                )));
            }
            for &dep in &spec.dependencies {
                if dep >= index {
                    return Err(EngineError::InvalidPlan(format!(
                        "subtask {index} depends on {dep}; dependencies must reference earlier subtasks only"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Accept a plan: create children, add edges, materialize the
    /// topological order, and move the parent to PLAN_DONE.
    ///
    /// The caller holds the graph writer lock for the whole call, which is
    /// the atomicity boundary observers rely on.
    pub fn apply_plan(
        &mut self,
        parent: NodeId,
        specs: &[SubtaskSpec],
        max_layers: u32,
    ) -> Result<PlanApplication> {
        Self::validate_plan(specs)?;

        let (parent_nid, parent_layer) = {
            let node = self
                .get(parent)
                .ok_or_else(|| EngineError::InvalidPlan(format!("unknown parent node {parent}")))?;
            (node.nid.clone(), node.layer)
        };

        let mut added = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let id = NodeId(self.nodes.len() as u64);
            let layer = parent_layer + 1;
            // A child marked for decomposition still may not plan past the
            // depth bound; it is born EXECUTE instead.
            let kind = if spec.decompose && layer < max_layers {
                NodeKind::Plan
            } else {
                NodeKind::Execute
            };
            let mut node = Node::new(
                id,
                parent_nid.child(index + 1),
                kind,
                spec.task_type,
                spec.goal.clone(),
                layer,
                Some(parent),
            );
            node.length_hint = spec.length_hint;
            self.nodes.push(node);
            added.push(id);
        }

        let mut edges = Vec::new();
        for (index, spec) in specs.iter().enumerate() {
            let to = added[index];
            for &dep in &spec.dependencies {
                let from = added[dep];
                edges.push((from, to));
                if let Some(node) = self.get_mut(to) {
                    node.predecessors.push(from);
                }
            }
        }

        let topo = Self::topo_sort(&added, &edges).ok_or_else(|| {
            EngineError::InvalidPlan("dependency relation contains a cycle".into())
        })?;

        self.inner.insert(
            parent.0,
            InnerGraph {
                members: added.clone(),
                edges: edges.clone(),
                topo,
            },
        );

        Ok(PlanApplication { added, edges })
    }

    fn topo_sort(members: &[NodeId], edges: &[(NodeId, NodeId)]) -> Option<Vec<NodeId>> {
        let mut indegree: HashMap<NodeId, usize> = members.iter().map(|&m| (m, 0)).collect();
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &(from, to) in edges {
            *indegree.get_mut(&to)? += 1;
            successors.entry(from).or_default().push(to);
        }

        // Members enter the queue in plan order, which makes the result
        // deterministic across runs.
        let mut queue: VecDeque<NodeId> = members
            .iter()
            .copied()
            .filter(|m| indegree[m] == 0)
            .collect();
        let mut order = Vec::with_capacity(members.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(next) = successors.get(&id) {
                for &succ in next {
                    let entry = indegree.get_mut(&succ)?;
                    *entry -= 1;
                    if *entry == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }

        (order.len() == members.len()).then_some(order)
    }

    /// Flip NOT_READY nodes whose predecessors finished and whose parent
    /// admits work. Returns the flips for event emission.
    pub fn advance_readiness(&mut self) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        for index in 0..self.nodes.len() {
            let id = NodeId(index as u64);
            if self.nodes[index].status != NodeStatus::NotReady {
                continue;
            }
            if !self.parent_admits_work(id) {
                continue;
            }
            if !self.predecessors_finished(id) {
                continue;
            }
            self.nodes[index].status = NodeStatus::Ready;
            changes.push(StatusChange {
                id,
                old: NodeStatus::NotReady,
                new: NodeStatus::Ready,
            });
        }
        changes
    }

    /// Flip PLAN_DONE nodes whose children all reached a terminal state.
    ///
    /// A FAILED child does not block aggregation; the aggregation
    /// capability sees its error record and may still produce a degraded
    /// result.
    pub fn advance_aggregation(&mut self) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        for index in 0..self.nodes.len() {
            let id = NodeId(index as u64);
            if self.nodes[index].status != NodeStatus::PlanDone {
                continue;
            }
            if !self.children_terminal(id) {
                continue;
            }
            self.nodes[index].status = NodeStatus::NeedUpdate;
            changes.push(StatusChange {
                id,
                old: NodeStatus::PlanDone,
                new: NodeStatus::NeedUpdate,
            });
        }
        changes
    }

    fn parent_admits_work(&self, id: NodeId) -> bool {
        match self.get(id).and_then(|n| n.outer) {
            None => true,
            Some(outer) => self
                .get(outer)
                .map(|p| p.status == NodeStatus::PlanDone)
                .unwrap_or(false),
        }
    }

    fn predecessors_finished(&self, id: NodeId) -> bool {
        let Some(node) = self.get(id) else { return false };
        node.predecessors
            .iter()
            .all(|&p| self.get(p).map(|n| n.status == NodeStatus::Finished).unwrap_or(false))
    }

    fn children_terminal(&self, id: NodeId) -> bool {
        match self.inner.get(&id.0) {
            None => false,
            Some(graph) => graph
                .members
                .iter()
                .all(|&c| self.get(c).map(|n| n.status.is_terminal()).unwrap_or(false)),
        }
    }

    /// Schedulable nodes ordered by `(layer, topological index, nid)`.
    pub fn candidates(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.status.is_schedulable())
            .map(|n| n.id)
            .collect();
        ids.sort_by_key(|&id| {
            let node = &self.nodes[id.0 as usize];
            (node.layer, self.topo_index(id), node.nid.segments())
        });
        ids
    }

    /// Change a node's status, returning the previous one.
    pub fn set_status(&mut self, id: NodeId, status: NodeStatus) -> Option<NodeStatus> {
        let node = self.get_mut(id)?;
        let old = node.status;
        node.status = status;
        Some(old)
    }

    /// Store a terminal outcome, enforcing write-once on FINISHED results.
    pub fn record_outcome(&mut self, id: NodeId, outcome: NodeOutcome, status: NodeStatus) -> Result<()> {
        let node = self
            .get_mut(id)
            .ok_or_else(|| EngineError::InvalidPlan(format!("unknown node {id}")))?;
        if node.status == NodeStatus::Finished && node.outcome.is_some() {
            return Err(EngineError::Configuration(format!(
                "node {} already finished; result is write-once",
                node.nid
            )));
        }
        node.outcome = Some(outcome);
        node.status = status;
        Ok(())
    }

    /// Whether any node is in DOING.
    pub fn any_doing(&self) -> bool {
        self.nodes.iter().any(|n| n.status == NodeStatus::Doing)
    }

    /// `(finished, total)` node counts for progress reporting.
    pub fn progress(&self) -> (usize, usize) {
        let finished = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Finished)
            .count();
        (finished, self.nodes.len())
    }

    /// Lowest (by nid) non-terminal node, named in deadlock reports.
    pub fn first_blocked(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .filter(|n| !n.status.is_terminal())
            .min_by(|a, b| a.nid.cmp(&b.nid))
    }

    /// Finished composition leaves in nid order; the running article is
    /// their concatenation.
    pub fn finished_compositions(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| {
                n.kind == NodeKind::Execute
                    && n.task_type == TaskType::Composition
                    && n.status == NodeStatus::Finished
            })
            .collect();
        nodes.sort_by(|a, b| a.nid.cmp(&b.nid));
        nodes
    }

    /// Add a dependency edge without validation.
    ///
    /// Test support for fault injection; the scheduler never calls this.
    /// Invalid edges produced here surface later as deadlocks.
    pub fn inject_edge_unchecked(&mut self, from: NodeId, to: NodeId) {
        if let Some(node) = self.get_mut(to) {
            node.predecessors.push(from);
        }
        if let Some(outer) = self.get(to).and_then(|n| n.outer) {
            if let Some(graph) = self.inner.get_mut(&outer.0) {
                graph.edges.push((from, to));
            }
        }
    }

    /// Verify the structural invariants. Returns a description of the
    /// first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        // Containment forms a tree: every non-root has a parent that lists
        // it exactly once, and walking outer pointers reaches the root.
        let mut listed: HashMap<NodeId, usize> = HashMap::new();
        for graph in self.inner.values() {
            for &member in &graph.members {
                *listed.entry(member).or_insert(0) += 1;
            }
        }
        for node in &self.nodes {
            if node.id == self.root {
                if node.outer.is_some() {
                    return Err("root must not have a containment parent".into());
                }
                continue;
            }
            match node.outer {
                None => return Err(format!("node {} has no containment parent", node.nid)),
                Some(outer) => {
                    let count = listed.get(&node.id).copied().unwrap_or(0);
                    if count != 1 {
                        return Err(format!(
                            "node {} is listed {} times in inner graphs",
                            node.nid, count
                        ));
                    }
                    let in_parent = self
                        .inner
                        .get(&outer.0)
                        .map(|g| g.members.contains(&node.id))
                        .unwrap_or(false);
                    if !in_parent {
                        return Err(format!(
                            "node {} is not a member of its parent's inner graph",
                            node.nid
                        ));
                    }
                }
            }

            // Walk to the root; a cycle would loop longer than the arena.
            let mut current = node.outer;
            let mut steps = 0;
            while let Some(id) = current {
                if id == self.root {
                    break;
                }
                steps += 1;
                if steps > self.nodes.len() {
                    return Err(format!("containment cycle reaching node {}", node.nid));
                }
                current = self.get(id).and_then(|n| n.outer);
            }
        }

        // Predecessors are siblings, and each inner relation is acyclic.
        for node in &self.nodes {
            for &pred in &node.predecessors {
                let pred_outer = self.get(pred).and_then(|n| n.outer);
                if pred_outer != node.outer {
                    return Err(format!(
                        "predecessor {} of {} is not a sibling",
                        pred,
                        node.nid
                    ));
                }
            }
        }
        for (owner, graph) in &self.inner {
            if Self::topo_sort(&graph.members, &graph.edges).is_none() {
                let nid = self
                    .get(NodeId(*owner))
                    .map(|n| n.nid.to_string())
                    .unwrap_or_else(|| owner.to_string());
                return Err(format!("inner graph of {} contains a cycle", nid));
            }
        }
        Ok(())
    }

    /// Hierarchical point-in-time view for visualization endpoints.
    pub fn hierarchy_view(&self) -> GraphView {
        self.view_of(self.root)
    }

    fn view_of(&self, id: NodeId) -> GraphView {
        let node = &self.nodes[id.0 as usize];
        let children = self
            .inner
            .get(&id.0)
            .map(|g| g.members.iter().map(|&c| self.view_of(c)).collect())
            .unwrap_or_default();
        GraphView {
            id: node.id.0,
            nid: node.nid.to_string(),
            kind: node.kind,
            task_type: node.task_type,
            goal: node.goal.clone(),
            status: node.status,
            layer: node.layer,
            result: node.outcome.clone(),
            dependencies: node
                .predecessors
                .iter()
                .filter_map(|&p| self.get(p).map(|n| n.nid.to_string()))
                .collect(),
            children,
        }
    }
}

/// Serializable nested view of the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphView {
    pub id: u64,
    pub nid: String,
    pub kind: NodeKind,
    pub task_type: TaskType,
    pub goal: String,
    pub status: NodeStatus,
    pub layer: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<NodeOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<GraphView>,
}

impl GraphView {
    /// Total node count of this subtree.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(|c| c.count()).sum::<usize>()
    }
}
