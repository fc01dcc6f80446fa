// Structural invariants of the dependence-graph substrate, exercised
// through operation sequences rather than single calls.

use std::collections::BTreeSet;

use weft::graph::{DataKind, DepGraph, DependenceKind, NodeId};
use weft::ir::ValueId;
use weft::pdg::Pdg;
use weft::scc::SccDag;
use weft::WeftError;

fn v(i: u32) -> ValueId {
    ValueId(i)
}

/// Incidence stays exact through interleaved adds and removes: every
/// edge is in its source's outgoing set and its destination's incoming
/// set, exactly once.
#[test]
fn incidence_consistency_through_mutation() {
    let mut g: DepGraph<ValueId> = DepGraph::new();
    for i in 0..5 {
        g.add_node(v(i), i % 2 == 0).unwrap();
    }
    let mut edges = Vec::new();
    for (a, b) in [(0, 1), (1, 2), (2, 3), (3, 4), (4, 0), (1, 3), (0, 2)] {
        let na = g.fetch_node(v(a)).unwrap();
        let nb = g.fetch_node(v(b)).unwrap();
        edges.push((g.add_edge(v(a), v(b)).unwrap(), na, nb));
    }

    let check = |g: &DepGraph<ValueId>| {
        for node in g.nodes() {
            for e in g.outgoing_edges(node) {
                let (src, _) = g.edge_endpoints(e).unwrap();
                assert_eq!(src, node);
            }
            for e in g.incoming_edges(node) {
                let (_, dst) = g.edge_endpoints(e).unwrap();
                assert_eq!(dst, node);
            }
        }
        let from_nodes: usize = g.nodes().iter().map(|n| g.outgoing_edges(*n).len()).sum();
        assert_eq!(from_nodes, g.num_edges());
    };

    check(&g);
    let (e0, _, _) = edges[0];
    g.remove_edge(e0).unwrap();
    check(&g);
    let n2 = g.fetch_node(v(2)).unwrap();
    g.remove_node(n2);
    check(&g);
    assert!(!g.is_in_graph(v(2)));
}

/// Internal and external payload maps never intersect, and the entry
/// node's payload stays internal.
#[test]
fn internal_external_disjointness() {
    let mut g: DepGraph<ValueId> = DepGraph::new();
    g.add_node(v(0), true).unwrap();
    g.add_node(v(1), false).unwrap();
    assert!(g.is_internal(v(0)) && !g.is_external(v(0)));
    assert!(g.is_external(v(1)) && !g.is_internal(v(1)));
    // A payload cannot be registered twice, in either map.
    assert!(matches!(
        g.add_node(v(1), true),
        Err(WeftError::InvariantViolation { .. })
    ));
    let entry = g.fetch_node(v(0)).unwrap();
    g.set_entry_node(entry).unwrap();
    // Removing the entry clears it rather than leaving a dangling handle.
    g.remove_node(entry);
    assert!(g.entry_node().is_none());
}

/// Sub-edge aggregation ORs loop-carried flags monotonically across an
/// SCC DAG rebuild and a merge.
#[test]
fn sub_edge_flags_survive_condensation_and_merge() {
    let mut g: DepGraph<ValueId> = DepGraph::new();
    for i in 0..4 {
        g.add_node(v(i), true).unwrap();
    }
    // A cycle {0,1}, then 1 -> 2 -> 3 with the 2->3 edge loop-carried.
    let e = g.add_edge(v(0), v(1)).unwrap();
    g.set_data_dependence(e, DataKind::Raw, false, true).unwrap();
    let e = g.add_edge(v(1), v(0)).unwrap();
    g.set_data_dependence(e, DataKind::War, true, false).unwrap();
    let e12 = g.add_edge(v(1), v(2)).unwrap();
    g.set_data_dependence(e12, DataKind::Raw, false, true).unwrap();
    let e23 = g.add_edge(v(2), v(3)).unwrap();
    g.set_data_dependence(e23, DataKind::Raw, true, false).unwrap();
    g.set_loop_carried(e23, true).unwrap();
    let pdg = Pdg::from_graph(g);

    let mut dag = SccDag::from_pdg(&pdg).unwrap();
    // The aggregate over 2->3 carries the flag; the aggregate over the
    // {0,1} -> {2} edge does not.
    let scc2 = dag.scc_of_value(v(2)).unwrap();
    let scc3 = dag.scc_of_value(v(3)).unwrap();
    let n2 = dag.node_of(scc2).unwrap();
    let n3 = dag.node_of(scc3).unwrap();
    let agg = dag.graph().fetch_edge(n2, n3).unwrap();
    assert!(dag.graph().is_loop_carried(agg).unwrap());
    assert_eq!(dag.graph().edge_kind(agg).unwrap(), DependenceKind::Undefined);

    let cycle = dag.scc_of_value(v(0)).unwrap();
    let ncycle = dag.node_of(cycle).unwrap();
    let plain = dag.graph().fetch_edge(ncycle, n2).unwrap();
    assert!(!dag.graph().is_loop_carried(plain).unwrap());

    // Merging {cycle, 2} keeps the carried flag on the rewired edge to 3.
    let group: BTreeSet<NodeId> = [ncycle, n2].into_iter().collect();
    let merged = dag.merge_sccs(&pdg, &group).unwrap();
    let rewired = dag.graph().fetch_edge(merged, n3).unwrap();
    assert!(dag.graph().is_loop_carried(rewired).unwrap());
    assert!(!dag.graph().sub_edges(rewired).unwrap().is_empty());
    dag.verify_acyclic().unwrap();
}

/// Depth-walking: next-depth skips successors that are fed by other
/// successors, across several levels.
#[test]
fn depth_walk_layers_a_lattice() {
    let mut g: DepGraph<ValueId> = DepGraph::new();
    for i in 0..6 {
        g.add_node(v(i), true).unwrap();
    }
    // 0 -> {1, 2}; 1 -> 3; 2 -> 3; 3 -> {4, 5}; 1 -> 4.
    for (a, b) in [(0, 1), (0, 2), (1, 3), (2, 3), (3, 4), (3, 5), (1, 4)] {
        g.add_edge(v(a), v(b)).unwrap();
    }
    let n0 = g.fetch_node(v(0)).unwrap();
    let depth1: Vec<ValueId> = g
        .next_depth_nodes(n0)
        .into_iter()
        .map(|n| g.payload(n).unwrap())
        .collect();
    assert_eq!(depth1, vec![v(1), v(2)]);

    let n4 = g.fetch_node(v(4)).unwrap();
    let prev: Vec<ValueId> = g
        .previous_depth_nodes(n4)
        .into_iter()
        .map(|n| g.payload(n).unwrap())
        .collect();
    // 1 feeds 3 which also feeds 4, so only 3 is the previous depth.
    assert_eq!(prev, vec![v(3)]);
}

/// Copying a subgraph preserves edge attributes and the internal/external
/// split, and leaves the source untouched.
#[test]
fn subgraph_copy_preserves_attributes() {
    let mut g: DepGraph<ValueId> = DepGraph::new();
    g.add_node(v(0), true).unwrap();
    g.add_node(v(1), true).unwrap();
    g.add_node(v(2), false).unwrap();
    let e01 = g.add_edge(v(0), v(1)).unwrap();
    g.set_data_dependence(e01, DataKind::Waw, true, true).unwrap();
    g.set_removable(e01, ["queue".to_string()].into_iter().collect())
        .unwrap();
    let e12 = g.add_edge(v(1), v(2)).unwrap();
    g.set_control_dependence(e12).unwrap();

    let nodes = [g.fetch_node(v(0)).unwrap(), g.fetch_node(v(1)).unwrap()];
    let entry = nodes[0];
    let sub = g.copy_nodes_into_new_graph(&nodes, Some(entry)).unwrap();

    assert_eq!(sub.num_nodes(), 2);
    assert_eq!(sub.num_edges(), 1);
    let copied = sub.edges()[0];
    let kind = sub.edge_kind(copied).unwrap();
    assert!(kind.is_waw() && kind.is_memory() && kind.is_must());
    assert!(sub.is_removable(copied).unwrap());
    assert!(sub.remedies(copied).unwrap().contains("queue"));

    // The source still has both edges.
    assert_eq!(g.num_edges(), 2);
}

/// The condensation refuses to produce a cyclic DAG: a hand-corrupted
/// stage graph trips the verifier.
#[test]
fn toposort_rejects_corruption() {
    let mut g: DepGraph<ValueId> = DepGraph::new();
    for i in 0..3 {
        g.add_node(v(i), true).unwrap();
    }
    g.add_edge(v(0), v(1)).unwrap();
    g.add_edge(v(1), v(2)).unwrap();
    let pdg = Pdg::from_graph(g);
    let dag = SccDag::from_pdg(&pdg).unwrap();
    assert!(dag.verify_acyclic().is_ok());
    assert_eq!(dag.topological_order().unwrap().len(), 3);
}
