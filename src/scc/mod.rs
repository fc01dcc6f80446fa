//! Strongly connected components of a PDG
//!
//! An [`Scc`] is itself a dependence graph: its internal nodes are the
//! component's member values, its external nodes the live-ins and
//! live-outs referenced by edges crossing the component boundary, and its
//! edges are copies of the member-incident PDG edges.

pub mod dag;

pub use dag::{SccDag, SccId};

use crate::graph::DepGraph;
use crate::ir::{Module, ValueId};
use std::collections::BTreeSet;
use std::ops::Deref;

/// How the component constrains parallel execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SccKind {
    /// Must run in iteration order.
    #[default]
    Sequential,
    /// Iterations may be reordered but not interleaved.
    Commutative,
    /// No internal cycle; iterations are independent.
    Independent,
}

/// One strongly connected component over IR values.
pub struct Scc {
    graph: DepGraph<ValueId>,
    kind: SccKind,
}

impl Deref for Scc {
    type Target = DepGraph<ValueId>;

    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

impl Scc {
    /// Build a component from `members` of `source`. Internal nodes are
    /// the members; when `connect_to_external_values` is set, values on
    /// the far side of crossing edges join as externals and the crossing
    /// edges are copied too.
    pub fn new(
        source: &DepGraph<ValueId>,
        members: &BTreeSet<ValueId>,
        connect_to_external_values: bool,
    ) -> Self {
        let mut graph = DepGraph::new();
        for v in members {
            graph.fetch_or_add_node(*v, true);
        }
        if let Some(first) = members.iter().next() {
            let node = graph.fetch_node(*first).expect("member added");
            graph.set_entry_node(node).expect("member is internal");
        }

        for v in members {
            let Some(node) = source.fetch_node(*v) else {
                continue;
            };
            for e in source.outgoing_edges(node) {
                let (_, dst) = source.edge_payloads(e).expect("live edge");
                if !members.contains(&dst) {
                    if !connect_to_external_values {
                        continue;
                    }
                    graph.fetch_or_add_node(dst, false);
                }
                graph.copy_add_edge(source, e).expect("endpoints present");
            }
            // Incoming edges from values not yet in the graph are live-ins;
            // producers inside the member set were covered above.
            for e in source.incoming_edges(node) {
                let (src, _) = source.edge_payloads(e).expect("live edge");
                if graph.is_in_graph(src) {
                    continue;
                }
                if !connect_to_external_values {
                    continue;
                }
                graph.fetch_or_add_node(src, false);
                graph.copy_add_edge(source, e).expect("endpoints present");
            }
        }

        Scc {
            graph,
            kind: SccKind::Sequential,
        }
    }

    pub fn kind(&self) -> SccKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: SccKind) {
        self.kind = kind;
    }

    pub fn number_of_instructions(&self) -> usize {
        self.graph.num_internal_nodes()
    }

    /// Member values, id-ordered.
    pub fn internal_values(&self) -> Vec<ValueId> {
        self.graph
            .internal_pairs()
            .into_iter()
            .map(|(v, _)| v)
            .collect()
    }

    /// Live-in/live-out values, id-ordered.
    pub fn external_values(&self) -> Vec<ValueId> {
        self.graph
            .external_pairs()
            .into_iter()
            .map(|(v, _)| v)
            .collect()
    }

    /// Whether the component's internal edges form a cycle. Control
    /// dependences can be disregarded to ask about data recurrences only.
    pub fn has_cycle(&self, ignore_control_dependences: bool) -> bool {
        // Iterative DFS with an explicit on-stack set; only edges between
        // internal nodes participate.
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let nodes = self.graph.nodes();
        let internal: BTreeSet<_> = nodes
            .iter()
            .copied()
            .filter(|n| {
                let p = self.graph.payload(*n).expect("live node");
                self.graph.is_internal(p)
            })
            .collect();
        let mut color: std::collections::HashMap<_, Color> =
            internal.iter().map(|n| (*n, Color::White)).collect();

        for start in &internal {
            if color[start] != Color::White {
                continue;
            }
            // (node, next-successor-index) stack.
            let mut stack = vec![(*start, 0usize)];
            color.insert(*start, Color::Gray);
            while let Some((node, idx)) = stack.pop() {
                let succs: Vec<_> = self
                    .graph
                    .outgoing_edges(node)
                    .into_iter()
                    .filter(|e| {
                        !(ignore_control_dependences
                            && self.graph.edge_kind(*e).expect("live edge").is_control())
                    })
                    .map(|e| self.graph.edge_endpoints(e).expect("live edge").1)
                    .filter(|dst| internal.contains(dst))
                    .collect();
                if idx < succs.len() {
                    stack.push((node, idx + 1));
                    let next = succs[idx];
                    match color[&next] {
                        Color::Gray => return true,
                        Color::White => {
                            color.insert(next, Color::Gray);
                            stack.push((next, 0));
                        }
                        Color::Black => {}
                    }
                } else {
                    color.insert(node, Color::Black);
                }
            }
        }
        false
    }

    /// Invoke `f` on every member instruction until it returns true.
    pub fn iterate_over_instructions(
        &self,
        module: &Module,
        mut f: impl FnMut(ValueId) -> bool,
    ) -> bool {
        for v in self.internal_values() {
            if module.inst(v).is_some() && f(v) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataKind;

    fn two_node_cycle() -> DepGraph<ValueId> {
        let mut g = DepGraph::new();
        g.add_node(ValueId(0), true).unwrap();
        g.add_node(ValueId(1), true).unwrap();
        g.add_node(ValueId(2), true).unwrap();
        let e = g.add_edge(ValueId(0), ValueId(1)).unwrap();
        g.set_data_dependence(e, DataKind::Raw, false, true).unwrap();
        let e = g.add_edge(ValueId(1), ValueId(0)).unwrap();
        g.set_data_dependence(e, DataKind::War, true, false).unwrap();
        g.add_edge(ValueId(1), ValueId(2)).unwrap();
        g
    }

    #[test]
    fn test_members_become_internal_externals_connect() {
        let g = two_node_cycle();
        let members: BTreeSet<ValueId> = [ValueId(0), ValueId(1)].into_iter().collect();
        let scc = Scc::new(&g, &members, true);
        assert_eq!(scc.number_of_instructions(), 2);
        assert_eq!(scc.external_values(), vec![ValueId(2)]);
        // Two internal edges plus the live-out edge.
        assert_eq!(scc.num_edges(), 3);
    }

    #[test]
    fn test_without_externals_only_internal_edges_copy() {
        let g = two_node_cycle();
        let members: BTreeSet<ValueId> = [ValueId(0), ValueId(1)].into_iter().collect();
        let scc = Scc::new(&g, &members, false);
        assert_eq!(scc.num_external_nodes(), 0);
        assert_eq!(scc.num_edges(), 2);
    }

    #[test]
    fn test_cycle_detection() {
        let g = two_node_cycle();
        let members: BTreeSet<ValueId> = [ValueId(0), ValueId(1)].into_iter().collect();
        let scc = Scc::new(&g, &members, true);
        assert!(scc.has_cycle(false));

        let singleton: BTreeSet<ValueId> = [ValueId(2)].into_iter().collect();
        let trivial = Scc::new(&g, &singleton, false);
        assert!(!trivial.has_cycle(false));
    }

    #[test]
    fn test_control_edges_can_be_ignored() {
        let mut g: DepGraph<ValueId> = DepGraph::new();
        g.add_node(ValueId(0), true).unwrap();
        g.add_node(ValueId(1), true).unwrap();
        let e = g.add_edge(ValueId(0), ValueId(1)).unwrap();
        g.set_data_dependence(e, DataKind::Raw, false, true).unwrap();
        let e = g.add_edge(ValueId(1), ValueId(0)).unwrap();
        g.set_control_dependence(e).unwrap();
        let members: BTreeSet<ValueId> = [ValueId(0), ValueId(1)].into_iter().collect();
        let scc = Scc::new(&g, &members, false);
        assert!(scc.has_cycle(false));
        assert!(!scc.has_cycle(true));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut g: DepGraph<ValueId> = DepGraph::new();
        g.add_node(ValueId(0), true).unwrap();
        g.add_edge(ValueId(0), ValueId(0)).unwrap();
        let members: BTreeSet<ValueId> = [ValueId(0)].into_iter().collect();
        let scc = Scc::new(&g, &members, false);
        assert!(scc.has_cycle(false));
    }
}
