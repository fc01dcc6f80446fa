//! DOT export for dependence graphs
//!
//! Renders a [`DepGraph`] to Graphviz DOT with caller-supplied node labels.
//! Edge styling is derived from the dependence kind: control dependences
//! dashed blue, memory dependences red, register dependences black;
//! loop-carried edges are drawn bold.

use super::{DepGraph, DependenceKind, NodeId};
use crate::diagnostics::Verbosity;
use std::fmt::Debug;
use std::fmt::Write as _;
use std::hash::Hash;
use std::path::Path;

/// File-name convention for exported graphs:
/// `technique-<kind>-loop-<id>.dot`.
pub fn dot_file_name(kind: &str, loop_id: usize) -> String {
    format!("technique-{kind}-loop-{loop_id}.dot")
}

/// Render the graph to DOT. `node_label` formats a node's payload.
pub fn export_dot<T, F>(graph: &DepGraph<T>, name: &str, mut node_label: F) -> String
where
    T: Copy + Eq + Hash + Ord + Debug,
    F: FnMut(T) -> String,
{
    let mut dot = format!("digraph \"{}\" {{\n", escape(name));
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=rounded];\n\n");

    for node in graph.nodes() {
        let payload = graph.payload(node).expect("live node");
        let label = escape(&node_label(payload));
        let style = if graph.is_external(payload) {
            " fillcolor=lightgray, style=\"rounded,filled\""
        } else if graph.entry_node() == Some(node) {
            " fillcolor=lightgreen, style=\"rounded,filled\""
        } else {
            ""
        };
        writeln!(dot, "  \"{}\" [label=\"{}\"{}];", node.0, label, style).ok();
    }

    dot.push('\n');
    for edge in graph.edges() {
        let (src, dst) = graph.edge_endpoints(edge).expect("live edge");
        let kind = graph.edge_kind(edge).expect("live edge");
        let carried = graph.is_loop_carried(edge).unwrap_or(false);
        let (color, style) = edge_attrs(kind, carried);
        writeln!(
            dot,
            "  \"{}\" -> \"{}\" [color={}, style={}, label=\"{}\"];",
            src.0,
            dst.0,
            color,
            style,
            kind.label()
        )
        .ok();
    }

    dot.push_str("}\n");
    dot
}

fn edge_attrs(kind: DependenceKind, loop_carried: bool) -> (&'static str, &'static str) {
    let color = match kind {
        DependenceKind::Control => "blue",
        DependenceKind::Data { memory: true, .. } => "red",
        DependenceKind::Data { .. } => "black",
        DependenceKind::Undefined => "gray",
    };
    let style = match (kind, loop_carried) {
        (DependenceKind::Control, _) => "dashed",
        (_, true) => "bold",
        _ => "solid",
    };
    (color, style)
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Write a rendered DOT string to disk. A failed write is recovered: the
/// error is reported through the diagnostics channel and analysis
/// continues.
pub fn write_dot_file(path: &Path, contents: &str, verbosity: Verbosity) {
    if let Err(err) = std::fs::write(path, contents) {
        if verbosity >= Verbosity::Minimal {
            tracing::warn!(path = %path.display(), %err, "could not write DOT file");
        }
    }
}

/// Convenience: highlight a set of nodes (e.g. one stage) in an otherwise
/// standard rendering.
pub fn export_dot_with_highlights<T, F>(
    graph: &DepGraph<T>,
    name: &str,
    highlighted: &[NodeId],
    node_label: F,
) -> String
where
    T: Copy + Eq + Hash + Ord + Debug,
    F: FnMut(T) -> String,
{
    let base = export_dot(graph, name, node_label);
    let mut out = String::with_capacity(base.len());
    for line in base.lines() {
        let mut line = line.to_string();
        for node in highlighted {
            let probe = format!("  \"{}\" [label=", node.0);
            if line.starts_with(&probe) {
                line = line.replace("];", " penwidth=2, color=orange];");
                break;
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}
