//! Graph rendering for inspection tooling.
//!
//! Renders a [`GraphView`] as DOT or Mermaid text. Containment is drawn as
//! solid edges, lateral dependencies as dashed ones.

use crate::graph::GraphView;
use std::fmt::Write;

/// Output format for graph rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VizFormat {
    Dot,
    Mermaid,
}

/// Render a graph view in the requested format.
pub fn render(view: &GraphView, format: VizFormat) -> String {
    match format {
        VizFormat::Dot => render_dot(view),
        VizFormat::Mermaid => render_mermaid(view),
    }
}

fn node_label(view: &GraphView) -> String {
    format!("{} {} [{}]", view.nid, view.task_type, view.status)
}

fn render_dot(view: &GraphView) -> String {
    let mut out = String::from("digraph scribe {\n    rankdir=TB;\n    node [shape=box];\n");
    walk_dot(view, &mut out);
    out.push_str("}\n");
    out
}

fn walk_dot(view: &GraphView, out: &mut String) {
    let _ = writeln!(
        out,
        "    \"{}\" [label=\"{}\"];",
        view.nid,
        node_label(view).replace('"', "'")
    );
    for child in &view.children {
        let _ = writeln!(out, "    \"{}\" -> \"{}\";", view.nid, child.nid);
        for dep in &child.dependencies {
            let _ = writeln!(out, "    \"{}\" -> \"{}\" [style=dashed];", dep, child.nid);
        }
        walk_dot(child, out);
    }
}

fn render_mermaid(view: &GraphView) -> String {
    let mut out = String::from("graph TD\n");
    walk_mermaid(view, &mut out);
    out
}

fn mermaid_id(nid: &str) -> String {
    format!("n{}", nid.replace('.', "_"))
}

fn walk_mermaid(view: &GraphView, out: &mut String) {
    let _ = writeln!(
        out,
        "    {}[\"{}\"]",
        mermaid_id(&view.nid),
        node_label(view).replace('"', "'")
    );
    for child in &view.children {
        let _ = writeln!(
            out,
            "    {} --> {}",
            mermaid_id(&view.nid),
            mermaid_id(&child.nid)
        );
        for dep in &child.dependencies {
            let _ = writeln!(
                out,
                "    {} -.-> {}",
                mermaid_id(dep),
                mermaid_id(&child.nid)
            );
        }
        walk_mermaid(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SubtaskSpec;
    use crate::graph::NodeArena;
    use crate::node::{NodeStatus, TaskType};

    fn sample_view() -> GraphView {
        let mut arena = NodeArena::new("story", TaskType::Composition);
        let root = arena.root();
        arena.advance_readiness();
        arena.set_status(root, NodeStatus::Doing);
        arena
            .apply_plan(
                root,
                &[
                    SubtaskSpec::new(TaskType::Composition, "intro"),
                    SubtaskSpec::new(TaskType::Composition, "body").depends_on(0),
                ],
                4,
            )
            .unwrap();
        arena.hierarchy_view()
    }

    #[test]
    fn test_dot_contains_containment_and_dependency_edges() {
        let dot = render(&sample_view(), VizFormat::Dot);
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("\"0\" -> \"0.1\";"));
        assert!(dot.contains("\"0.1\" -> \"0.2\" [style=dashed];"));
    }

    #[test]
    fn test_mermaid_ids_avoid_dots() {
        let mermaid = render(&sample_view(), VizFormat::Mermaid);
        assert!(mermaid.starts_with("graph TD"));
        assert!(mermaid.contains("n0 --> n0_1"));
        assert!(mermaid.contains("n0_1 -.-> n0_2"));
    }
}
