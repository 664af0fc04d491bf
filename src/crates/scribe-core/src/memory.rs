//! Context collection.
//!
//! Memory assembles the input a capability sees when acting on a node. It
//! owns no authoritative state: everything here is a pure function of the
//! graph at collection time, recomputed on each scheduler tick. The
//! running article in particular is derived from finished composition
//! nodes and never stored back.

use crate::config::{Mode, ScribeConfig};
use crate::graph::NodeArena;
use crate::node::{ActionName, NodeId, NodeKind, TaskType};
use serde::{Deserialize, Serialize};

/// Length, in characters, of outer-sibling summaries.
const SUMMARY_LEN: usize = 160;

/// Configuration slice exposed to capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub mode: Mode,
    pub max_layers: u32,
    pub post_reflect: bool,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Report,
            max_layers: 4,
            post_reflect: false,
        }
    }
}

/// Structured input context for one capability invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeContext {
    /// Ordered concatenation of finished composition results, in nid order.
    pub running_article: String,
    /// Goals of containment ancestors, root first, down to the parent.
    pub goal_trail: Vec<String>,
    /// Results of this node's predecessors, in topological order.
    pub predecessor_results: Vec<(String, String)>,
    /// Results of this node's children, populated for aggregation.
    pub child_results: Vec<(String, String)>,
    /// Short summaries of finished composition siblings.
    pub sibling_summaries: Vec<String>,
    /// Configuration applicable to this node's task type.
    pub settings: TaskSettings,
}

/// Serializable memory state written into snapshots.
///
/// Carries only derived values; on load, everything is recomputed from the
/// graph, and the article text is kept for inspection tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryState {
    pub article: String,
}

/// Stateless collector over the node arena.
pub struct Memory;

impl Memory {
    /// The running article: finished composition results in nid order.
    pub fn running_article(arena: &NodeArena) -> String {
        arena
            .finished_compositions()
            .iter()
            .map(|n| n.result_text())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Snapshot form of the derived memory.
    pub fn state(arena: &NodeArena) -> MemoryState {
        MemoryState {
            article: Self::running_article(arena),
        }
    }

    /// Build the context for dispatching `action` on node `id`.
    pub fn collect(
        arena: &NodeArena,
        id: NodeId,
        config: &ScribeConfig,
        action: ActionName,
    ) -> NodeContext {
        let Some(node) = arena.get(id) else {
            return NodeContext::default();
        };

        let mut context = NodeContext {
            running_article: Self::running_article(arena),
            settings: TaskSettings {
                mode: config.mode,
                max_layers: config.scheduler.max_layers,
                post_reflect: config.post_reflect.enabled,
            },
            ..Default::default()
        };

        // Ancestral goal trail, root first, excluding the node itself.
        let mut trail = Vec::new();
        let mut current = node.outer;
        while let Some(outer) = current {
            if let Some(ancestor) = arena.get(outer) {
                trail.push(ancestor.goal.clone());
                current = ancestor.outer;
            } else {
                break;
            }
        }
        trail.reverse();
        context.goal_trail = trail;

        // Predecessor results, ordered by the parent's topological order.
        let mut predecessors: Vec<NodeId> = node.predecessors.clone();
        predecessors.sort_by_key(|&p| arena.topo_index(p));
        context.predecessor_results = predecessors
            .iter()
            .filter_map(|&p| arena.get(p))
            .map(|p| (p.nid.to_string(), p.result_text()))
            .collect();

        // Children results feed aggregation; failed children appear as
        // their error rendering so a degraded aggregate is possible.
        if action == ActionName::Aggregate {
            if let Some(graph) = arena.inner_graph(id) {
                context.child_results = graph
                    .topo
                    .iter()
                    .filter_map(|&c| arena.get(c))
                    .map(|c| (c.nid.to_string(), c.result_text()))
                    .collect();
            }
        }

        // Composition nodes see summaries of already-finished composition
        // siblings that contributed earlier sections.
        if node.task_type == TaskType::Composition && node.kind == NodeKind::Execute {
            if let Some(outer) = node.outer {
                if let Some(graph) = arena.inner_graph(outer) {
                    let mut siblings: Vec<_> = graph
                        .members
                        .iter()
                        .filter(|&&s| s != id)
                        .filter_map(|&s| arena.get(s))
                        .filter(|s| {
                            s.task_type == TaskType::Composition
                                && s.status == crate::node::NodeStatus::Finished
                        })
                        .collect();
                    siblings.sort_by(|a, b| a.nid.cmp(&b.nid));
                    context.sibling_summaries = siblings
                        .iter()
                        .map(|s| Self::summarize(&s.result_text()))
                        .collect();
                }
            }
        }

        context
    }

    /// Bounded prefix summary, safe on multi-byte boundaries.
    pub fn summarize(text: &str) -> String {
        if text.chars().count() <= SUMMARY_LEN {
            return text.to_string();
        }
        let prefix: String = text.chars().take(SUMMARY_LEN).collect();
        format!("{prefix}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SubtaskSpec;
    use crate::node::{NodeOutcome, NodeStatus};

    fn arena_with_children() -> (NodeArena, Vec<NodeId>) {
        let mut arena = NodeArena::new("write a report on bees", TaskType::Composition);
        let root = arena.root();
        arena.advance_readiness();
        arena.set_status(root, NodeStatus::Doing);
        let application = arena
            .apply_plan(
                root,
                &[
                    SubtaskSpec::new(TaskType::Reasoning, "outline themes"),
                    SubtaskSpec::new(TaskType::Composition, "intro").depends_on(0),
                    SubtaskSpec::new(TaskType::Composition, "body").depends_on(1),
                ],
                4,
            )
            .unwrap();
        arena.set_status(root, NodeStatus::PlanDone);
        (arena, application.added)
    }

    #[test]
    fn test_running_article_nid_order() {
        let (mut arena, children) = arena_with_children();
        // Finish body before intro; article must still read intro first.
        arena
            .record_outcome(
                children[2],
                NodeOutcome::Text { text: "Body text.".into() },
                NodeStatus::Finished,
            )
            .unwrap();
        arena
            .record_outcome(
                children[1],
                NodeOutcome::Text { text: "Intro text.".into() },
                NodeStatus::Finished,
            )
            .unwrap();

        assert_eq!(Memory::running_article(&arena), "Intro text.\n\nBody text.");
    }

    #[test]
    fn test_reasoning_results_stay_out_of_article() {
        let (mut arena, children) = arena_with_children();
        arena
            .record_outcome(
                children[0],
                NodeOutcome::Conclusion { conclusion: "themes: pollination".into() },
                NodeStatus::Finished,
            )
            .unwrap();
        assert_eq!(Memory::running_article(&arena), "");
    }

    #[test]
    fn test_goal_trail_and_predecessors() {
        let (mut arena, children) = arena_with_children();
        arena
            .record_outcome(
                children[0],
                NodeOutcome::Conclusion { conclusion: "themes: pollination".into() },
                NodeStatus::Finished,
            )
            .unwrap();

        let config = ScribeConfig::default();
        let context = Memory::collect(&arena, children[1], &config, ActionName::Write);

        assert_eq!(context.goal_trail, vec!["write a report on bees".to_string()]);
        assert_eq!(
            context.predecessor_results,
            vec![("0.1".to_string(), "themes: pollination".to_string())]
        );
        assert!(context.child_results.is_empty());
    }

    #[test]
    fn test_child_results_for_aggregation_in_topo_order() {
        let (mut arena, children) = arena_with_children();
        for (i, &child) in children.iter().enumerate() {
            arena
                .record_outcome(
                    child,
                    NodeOutcome::Text { text: format!("part {i}") },
                    NodeStatus::Finished,
                )
                .unwrap();
        }

        let config = ScribeConfig::default();
        let context = Memory::collect(&arena, arena.root(), &config, ActionName::Aggregate);
        let nids: Vec<&str> = context.child_results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(nids, vec!["0.1", "0.2", "0.3"]);
    }

    #[test]
    fn test_sibling_summaries_only_for_finished_compositions() {
        let (mut arena, children) = arena_with_children();
        arena
            .record_outcome(
                children[1],
                NodeOutcome::Text { text: "Intro text that precedes the body.".into() },
                NodeStatus::Finished,
            )
            .unwrap();

        let config = ScribeConfig::default();
        let context = Memory::collect(&arena, children[2], &config, ActionName::Write);
        assert_eq!(context.sibling_summaries.len(), 1);
        assert!(context.sibling_summaries[0].starts_with("Intro text"));
    }

    #[test]
    fn test_summarize_bounds_length() {
        let long = "x".repeat(500);
        let summary = Memory::summarize(&long);
        assert!(summary.chars().count() <= SUMMARY_LEN + 1);
        assert!(summary.ends_with('…'));

        assert_eq!(Memory::summarize("short"), "short");
    }
}
