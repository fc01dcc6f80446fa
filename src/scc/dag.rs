//! SCC DAG: the condensation of a PDG
//!
//! Disconnected components of the PDG are enumerated first, each component
//! is condensed with Tarjan's algorithm, and every internal PDG value lands
//! in exactly one internal SCC. External PDG values (live-ins/outs of a
//! loop or function subgraph) get lazily-created external singleton SCCs
//! when an edge references them. Cross-SCC PDG edges become DAG edges that
//! aggregate the underlying value edges as sub-edges.
//!
//! The condensation is acyclic by construction; [`SccDag::verify_acyclic`]
//! turns a violated expectation into a fatal error.

use super::{Scc, SccKind};
use crate::error::{Result, WeftError};
use crate::graph::{DepGraph, DependenceKind, EdgeId, NodeId};
use crate::ir::{InstKind, Module, ValueId};
use crate::pdg::Pdg;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use std::collections::{BTreeSet, HashMap};

/// Handle to an SCC inside one [`SccDag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SccId(pub u32);

/// The condensation graph. Node payloads are [`SccId`]s into the owned
/// SCC arena.
pub struct SccDag {
    graph: DepGraph<SccId>,
    sccs: Vec<Scc>,
    value_to_scc: HashMap<ValueId, SccId>,
    connect_externals: bool,
}

impl SccDag {
    /// Condense a PDG; member SCCs carry their live-ins/outs as externals.
    pub fn from_pdg(pdg: &Pdg) -> Result<SccDag> {
        Self::from_pdg_with_externals(pdg, true)
    }

    /// Condense a PDG, choosing whether member SCCs record live-ins/outs.
    /// Dropping them models stages with no inter-stage queues in the cost
    /// oracle.
    pub fn from_pdg_with_externals(pdg: &Pdg, connect_externals: bool) -> Result<SccDag> {
        let mut dag = SccDag {
            graph: DepGraph::new(),
            sccs: Vec::new(),
            value_to_scc: HashMap::new(),
            connect_externals,
        };

        // Tarjan per disconnected component, internal values only.
        let internal: BTreeSet<ValueId> = pdg
            .internal_pairs()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        for component in pdg.disconnected_subgraphs() {
            let members: Vec<ValueId> = component
                .iter()
                .filter_map(|n| pdg.payload(*n).ok())
                .filter(|v| internal.contains(v))
                .collect();
            if members.is_empty() {
                continue;
            }
            let mut proj: DiGraph<ValueId, ()> = DiGraph::new();
            let mut node_of = HashMap::new();
            for v in &members {
                node_of.insert(*v, proj.add_node(*v));
            }
            for v in &members {
                let node = pdg.fetch_node(*v).expect("internal value");
                for e in pdg.outgoing_edges(node) {
                    let (_, dst) = pdg.edge_payloads(e).expect("live edge");
                    if let Some(dst_node) = node_of.get(&dst) {
                        proj.add_edge(node_of[v], *dst_node, ());
                    }
                }
            }
            for group in tarjan_scc(&proj) {
                let values: BTreeSet<ValueId> = group.iter().map(|n| proj[*n]).collect();
                dag.intern_scc(pdg, &values, true)?;
            }
        }

        // Cross-SCC edges, aggregating the value edges beneath them.
        for edge in pdg.edges() {
            let (src, dst) = pdg.edge_payloads(edge).expect("live edge");
            let from = dag.fetch_or_create_scc_for(pdg, src)?;
            let to = dag.fetch_or_create_scc_for(pdg, dst)?;
            let from_external = dag.graph.is_external(from);
            let to_external = dag.graph.is_external(to);
            if (from_external && to_external) || from == to {
                continue;
            }
            let from_node = dag.graph.fetch_node(from).expect("scc interned");
            let to_node = dag.graph.fetch_node(to).expect("scc interned");
            let dag_edge = match dag.graph.fetch_edge(from_node, to_node) {
                Some(e) => e,
                None => {
                    let e = dag.graph.add_edge(from, to)?;
                    dag.graph.set_edge_kind(e, DependenceKind::Undefined)?;
                    e
                }
            };
            let carried = pdg.is_loop_carried(edge)?;
            dag.graph.add_sub_edge(dag_edge, edge, carried)?;
        }

        dag.classify_sccs();
        dag.verify_acyclic()?;
        Ok(dag)
    }

    fn intern_scc(
        &mut self,
        pdg: &Pdg,
        values: &BTreeSet<ValueId>,
        internal: bool,
    ) -> Result<SccId> {
        let id = SccId(self.sccs.len() as u32);
        self.sccs
            .push(Scc::new(pdg.graph(), values, self.connect_externals));
        self.graph.add_node(id, internal)?;
        for v in values {
            self.value_to_scc.insert(*v, id);
        }
        Ok(id)
    }

    fn fetch_or_create_scc_for(&mut self, pdg: &Pdg, value: ValueId) -> Result<SccId> {
        if let Some(id) = self.value_to_scc.get(&value) {
            return Ok(*id);
        }
        // An external PDG value referenced by an edge: a singleton
        // external SCC.
        let values: BTreeSet<ValueId> = [value].into_iter().collect();
        self.intern_scc(pdg, &values, false)
    }

    /// Sequential when the component has an internal data recurrence,
    /// independent otherwise.
    fn classify_sccs(&mut self) {
        for scc in &mut self.sccs {
            let kind = if scc.has_cycle(false) {
                SccKind::Sequential
            } else {
                SccKind::Independent
            };
            scc.set_kind(kind);
        }
    }

    pub fn graph(&self) -> &DepGraph<SccId> {
        &self.graph
    }

    pub fn num_sccs(&self) -> usize {
        self.graph.num_nodes()
    }

    pub fn num_internal_sccs(&self) -> usize {
        self.graph.num_internal_nodes()
    }

    pub fn scc(&self, id: SccId) -> &Scc {
        &self.sccs[id.0 as usize]
    }

    /// Internal SCC ids, id-ordered.
    pub fn internal_sccs(&self) -> Vec<SccId> {
        self.graph
            .internal_pairs()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// The SCC holding a value.
    pub fn scc_of_value(&self, value: ValueId) -> Option<SccId> {
        self.value_to_scc.get(&value).copied()
    }

    pub fn node_of(&self, id: SccId) -> Option<NodeId> {
        self.graph.fetch_node(id)
    }

    /// Topological order of the internal SCCs; fails when the condensation
    /// holds a cycle (a construction bug).
    pub fn topological_order(&self) -> Result<Vec<SccId>> {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let nodes = self.graph.nodes();
        for n in &nodes {
            let non_self = self
                .graph
                .incoming_edges(*n)
                .into_iter()
                .filter(|e| {
                    let (src, _) = self.graph.edge_endpoints(*e).expect("live edge");
                    src != *n
                })
                .count();
            in_degree.insert(*n, non_self);
        }
        let mut ready: Vec<NodeId> = nodes
            .iter()
            .copied()
            .filter(|n| in_degree[n] == 0)
            .collect();
        let mut order = Vec::new();
        while let Some(n) = ready.pop() {
            order.push(self.graph.payload(n).expect("live node"));
            for e in self.graph.outgoing_edges(n) {
                let (_, dst) = self.graph.edge_endpoints(e).expect("live edge");
                if dst == n {
                    continue;
                }
                let d = in_degree.get_mut(&dst).expect("node seen");
                *d -= 1;
                if *d == 0 {
                    ready.push(dst);
                }
            }
        }
        if order.len() != nodes.len() {
            return Err(WeftError::invariant(
                "SccDag::topological_order",
                "condensation contains a cycle",
            ));
        }
        Ok(order)
    }

    /// I6: the condensation must be acyclic.
    pub fn verify_acyclic(&self) -> Result<()> {
        self.topological_order().map(|_| ())
    }

    /// Merge a set of SCC nodes into one. The merged SCC is rebuilt from
    /// the PDG over the union of the member values; incident DAG edges are
    /// rewired onto the new node with their sub-edges aggregated, and
    /// would-be self-loops are dropped.
    pub fn merge_sccs(&mut self, pdg: &Pdg, nodes: &BTreeSet<NodeId>) -> Result<NodeId> {
        if nodes.len() < 2 {
            return nodes.iter().next().copied().ok_or_else(|| {
                WeftError::invariant("SccDag::merge_sccs", "empty merge set")
            });
        }

        let mut member_values: BTreeSet<ValueId> = BTreeSet::new();
        let mut internal = false;
        for node in nodes {
            let id = self.graph.payload(*node)?;
            internal |= self.graph.is_internal(id);
            member_values.extend(self.scc(id).internal_values());
        }

        // Collect incident edges before touching the graph.
        struct Rewire {
            peer: NodeId,
            outgoing: bool,
            sub_edges: Vec<EdgeId>,
            loop_carried: bool,
        }
        let mut rewires: Vec<Rewire> = Vec::new();
        for node in nodes {
            for e in self.graph.outgoing_edges(*node) {
                let (_, dst) = self.graph.edge_endpoints(e)?;
                if nodes.contains(&dst) {
                    continue;
                }
                rewires.push(Rewire {
                    peer: dst,
                    outgoing: true,
                    sub_edges: self.graph.sub_edges(e)?.to_vec(),
                    loop_carried: self.graph.is_loop_carried(e)?,
                });
            }
            for e in self.graph.incoming_edges(*node) {
                let (src, _) = self.graph.edge_endpoints(e)?;
                if nodes.contains(&src) {
                    continue;
                }
                rewires.push(Rewire {
                    peer: src,
                    outgoing: false,
                    sub_edges: self.graph.sub_edges(e)?.to_vec(),
                    loop_carried: self.graph.is_loop_carried(e)?,
                });
            }
        }

        for node in nodes {
            self.graph.remove_node(*node);
        }

        let merged_id = SccId(self.sccs.len() as u32);
        self.sccs.push(Scc::new(
            pdg.graph(),
            &member_values,
            self.connect_externals,
        ));
        let merged_node = self.graph.add_node(merged_id, internal)?;
        for v in &member_values {
            self.value_to_scc.insert(*v, merged_id);
        }

        for rewire in rewires {
            let peer_id = self.graph.payload(rewire.peer)?;
            let (from_node, to_node, from_id, to_id) = if rewire.outgoing {
                (merged_node, rewire.peer, merged_id, peer_id)
            } else {
                (rewire.peer, merged_node, peer_id, merged_id)
            };
            let edge = match self.graph.fetch_edge(from_node, to_node) {
                Some(e) => e,
                None => {
                    let e = self.graph.add_edge(from_id, to_id)?;
                    self.graph.set_edge_kind(e, DependenceKind::Undefined)?;
                    e
                }
            };
            for sub in rewire.sub_edges {
                self.graph.add_sub_edge(edge, sub, rewire.loop_carried)?;
            }
        }

        self.classify_sccs();
        Ok(merged_node)
    }

    /// Absorb trivial PHI/GEP/cast singleton SCCs into their single
    /// neighbor, the way pipeline builders clean the condensation before
    /// partitioning. Returns the number of merge groups committed.
    pub fn merge_single_syntactic_sugar_sccs(
        &mut self,
        pdg: &Pdg,
        module: &Module,
    ) -> Result<usize> {
        let mut group_of: HashMap<NodeId, usize> = HashMap::new();
        let mut groups: Vec<BTreeSet<NodeId>> = Vec::new();

        for id in self.internal_sccs() {
            let scc = self.scc(id);
            if scc.number_of_instructions() != 1 {
                continue;
            }
            let value = scc.internal_values()[0];
            let Some(inst) = module.inst(value) else {
                continue;
            };
            if !inst.is_syntactic_sugar() {
                continue;
            }
            let node = self.node_of(id).expect("internal scc");

            // Pick the adjacent node: a lone consumer, else a lone
            // producer; PHIs and casts prefer their producer.
            let mut adjacent: Option<NodeId> = None;
            if self.graph.num_outgoing_edges(node) == 1 {
                adjacent = Some(
                    self.graph
                        .edge_endpoints(self.graph.outgoing_edges(node)[0])?
                        .1,
                );
            }
            if self.graph.num_incoming_edges(node) == 1 {
                let producer = self
                    .graph
                    .edge_endpoints(self.graph.incoming_edges(node)[0])?
                    .0;
                let prefer_producer = matches!(
                    inst.kind,
                    InstKind::Phi { .. } | InstKind::Cast { .. }
                );
                if adjacent.is_none() || prefer_producer {
                    adjacent = Some(producer);
                }
            }
            let Some(adjacent) = adjacent else { continue };
            if adjacent == node {
                continue;
            }

            match (group_of.get(&node).copied(), group_of.get(&adjacent).copied()) {
                (Some(a), Some(b)) if a != b => {
                    let absorbed = std::mem::take(&mut groups[b]);
                    for n in &absorbed {
                        group_of.insert(*n, a);
                    }
                    groups[a].extend(absorbed);
                }
                (Some(a), _) => {
                    groups[a].insert(adjacent);
                    group_of.insert(adjacent, a);
                }
                (None, Some(b)) => {
                    groups[b].insert(node);
                    group_of.insert(node, b);
                }
                (None, None) => {
                    let idx = groups.len();
                    groups.push([node, adjacent].into_iter().collect());
                    group_of.insert(node, idx);
                    group_of.insert(adjacent, idx);
                }
            }
        }

        let mut merged = 0;
        for group in groups.into_iter().filter(|g| g.len() >= 2) {
            self.merge_sccs(pdg, &group)?;
            merged += 1;
        }
        Ok(merged)
    }

    /// Merge leaf SCCs made only of comparisons and terminators into their
    /// previous-depth SCC.
    pub fn merge_tail_branches(&mut self, pdg: &Pdg, module: &Module) -> Result<usize> {
        let mut tails: Vec<NodeId> = Vec::new();
        for id in self.internal_sccs() {
            let node = self.node_of(id).expect("internal scc");
            if self.graph.num_incoming_edges(node) == 0
                || self.graph.num_outgoing_edges(node) > 0
            {
                continue;
            }
            let all_cmp_or_br = self.scc(id).internal_values().iter().all(|v| {
                module.inst(*v).is_some_and(|i| {
                    i.is_terminator() || matches!(i.kind, InstKind::Cmp { .. })
                })
            });
            if all_cmp_or_br {
                tails.push(node);
            }
        }

        let mut merged = 0;
        for tail in tails {
            // Earlier merges may have consumed the node.
            if self.graph.payload(tail).is_err() {
                continue;
            }
            let Some(prev) = self.graph.previous_depth_nodes(tail).first().copied() else {
                continue;
            };
            let group: BTreeSet<NodeId> = [tail, prev].into_iter().collect();
            self.merge_sccs(pdg, &group)?;
            merged += 1;
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataKind;
    use crate::ir::alias::BaseObjectAliasOracle;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::Type;
    use crate::pdg::{PdgBuilder, PdgOptions};

    /// A PDG with a chain a -> b -> c built directly on the graph layer.
    fn chain_pdg() -> Pdg {
        let mut g = DepGraph::new();
        g.add_node(ValueId(0), true).unwrap();
        g.add_node(ValueId(1), true).unwrap();
        g.add_node(ValueId(2), true).unwrap();
        let e = g.add_edge(ValueId(0), ValueId(1)).unwrap();
        g.set_data_dependence(e, DataKind::Raw, false, true).unwrap();
        let e = g.add_edge(ValueId(1), ValueId(2)).unwrap();
        g.set_data_dependence(e, DataKind::Raw, false, true).unwrap();
        Pdg::from_graph(g)
    }

    fn cycle_pdg() -> Pdg {
        let mut g = DepGraph::new();
        g.add_node(ValueId(0), true).unwrap();
        g.add_node(ValueId(1), true).unwrap();
        let e = g.add_edge(ValueId(0), ValueId(1)).unwrap();
        g.set_data_dependence(e, DataKind::Raw, false, true).unwrap();
        let e = g.add_edge(ValueId(1), ValueId(0)).unwrap();
        g.set_data_dependence(e, DataKind::War, true, false).unwrap();
        Pdg::from_graph(g)
    }

    #[test]
    fn test_chain_condenses_to_three_singletons() {
        let pdg = chain_pdg();
        let dag = SccDag::from_pdg(&pdg).unwrap();
        assert_eq!(dag.num_internal_sccs(), 3);
        assert_eq!(dag.graph().num_edges(), 2);
        let order = dag.topological_order().unwrap();
        let first = dag.scc(order[0]).internal_values();
        let last = dag.scc(order[2]).internal_values();
        assert_eq!(first, vec![ValueId(0)]);
        assert_eq!(last, vec![ValueId(2)]);
    }

    #[test]
    fn test_two_node_cycle_condenses_to_one_scc() {
        let pdg = cycle_pdg();
        let dag = SccDag::from_pdg(&pdg).unwrap();
        assert_eq!(dag.num_internal_sccs(), 1);
        assert_eq!(dag.graph().num_edges(), 0);
        let id = dag.internal_sccs()[0];
        assert_eq!(dag.scc(id).number_of_instructions(), 2);
        assert_eq!(dag.scc(id).kind(), SccKind::Sequential);
        assert_eq!(dag.scc_of_value(ValueId(0)), Some(id));
        assert_eq!(dag.scc_of_value(ValueId(1)), Some(id));
    }

    #[test]
    fn test_dag_edges_aggregate_sub_edges() {
        let pdg = chain_pdg();
        let dag = SccDag::from_pdg(&pdg).unwrap();
        for e in dag.graph().edges() {
            assert_eq!(dag.graph().sub_edges(e).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_condensation_is_idempotent_up_to_renaming() {
        let pdg = chain_pdg();
        let a = SccDag::from_pdg(&pdg).unwrap();
        let b = SccDag::from_pdg(&pdg).unwrap();
        let sig = |dag: &SccDag| -> Vec<Vec<ValueId>> {
            let mut out: Vec<Vec<ValueId>> = dag
                .internal_sccs()
                .iter()
                .map(|id| dag.scc(*id).internal_values())
                .collect();
            out.sort();
            out
        };
        assert_eq!(sig(&a), sig(&b));
        assert_eq!(a.graph().num_edges(), b.graph().num_edges());
    }

    #[test]
    fn test_merge_rewires_and_drops_self_loops() {
        let pdg = chain_pdg();
        let mut dag = SccDag::from_pdg(&pdg).unwrap();
        let a = dag.scc_of_value(ValueId(0)).unwrap();
        let b = dag.scc_of_value(ValueId(1)).unwrap();
        let group: BTreeSet<NodeId> =
            [dag.node_of(a).unwrap(), dag.node_of(b).unwrap()].into_iter().collect();
        dag.merge_sccs(&pdg, &group).unwrap();
        assert_eq!(dag.num_internal_sccs(), 2);
        // One edge remains: merged -> {c}.
        assert_eq!(dag.graph().num_edges(), 1);
        dag.verify_acyclic().unwrap();
        let merged = dag.scc_of_value(ValueId(0)).unwrap();
        assert_eq!(merged, dag.scc_of_value(ValueId(1)).unwrap());
        assert_eq!(dag.scc(merged).number_of_instructions(), 2);
    }

    #[test]
    fn test_sugar_singletons_are_absorbed() {
        // p = alloca; gep = gep p, 0; store c -> gep. The GEP singleton
        // should merge away.
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 0, Type::Void);
        let b0 = mb.block(f);
        let p = mb.alloca(f, b0, Type::Array { size: 4 });
        let zero = mb.const_int(0);
        let gep = mb.gep(f, b0, p, vec![zero]);
        let c = mb.const_int(7);
        mb.store(f, b0, c, gep);
        mb.ret(f, b0, None);
        let m = mb.finish();
        let pdg = PdgBuilder::from_module(&m, &BaseObjectAliasOracle, &PdgOptions::default())
            .unwrap();
        let mut dag = SccDag::from_pdg(&pdg).unwrap();
        let before = dag.num_internal_sccs();
        let merged = dag.merge_single_syntactic_sugar_sccs(&pdg, &m).unwrap();
        assert!(merged > 0);
        assert!(dag.num_internal_sccs() < before);
        let gep_scc = dag.scc_of_value(gep).unwrap();
        assert!(dag.scc(gep_scc).number_of_instructions() > 1);
        dag.verify_acyclic().unwrap();
    }
}
