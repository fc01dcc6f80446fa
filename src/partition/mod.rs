//! Stage partitioning of the SCC DAG
//!
//! A [`Partition`] groups SCCs into pipeline stages. It starts with one
//! stage per internal SCC and maintains a stage graph, a condensation of
//! the condensation, that stays acyclic through every merge: merging two
//! stages also merges every stage sitting on a directed path between them,
//! so the collapsed set is always convex in the DAG.

pub mod cost;
pub mod heuristics;

pub use cost::InvocationLatency;
pub use heuristics::{Heuristics, MinMaxSizeAnalysis, SmallestSizeAnalysis, SmallestSizeOptions};

use crate::error::{Result, WeftError};
use crate::graph::{DepGraph, DependenceKind, NodeId};
use crate::ir::{BlockId, FunctionId, Module};
use crate::scc::{SccDag, SccId};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Handle to a stage of one [`Partition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

/// A set of SCCs scheduled as one pipeline stage.
#[derive(Debug, Clone, Default)]
pub struct Stage {
    pub sccs: BTreeSet<SccId>,
}

/// The mutable stage graph over an SCC DAG.
pub struct Partition {
    graph: DepGraph<StageId>,
    stages: Vec<Stage>,
    scc_to_stage: HashMap<SccId, StageId>,
}

impl Partition {
    /// One stage per internal SCC; stage edges mirror the DAG edges.
    pub fn new(dag: &SccDag) -> Result<Partition> {
        let mut partition = Partition {
            graph: DepGraph::new(),
            stages: Vec::new(),
            scc_to_stage: HashMap::new(),
        };
        for scc in dag.internal_sccs() {
            let id = StageId(partition.stages.len() as u32);
            partition.stages.push(Stage {
                sccs: [scc].into_iter().collect(),
            });
            partition.graph.add_node(id, true)?;
            partition.scc_to_stage.insert(scc, id);
        }
        for edge in dag.graph().edges() {
            let (src, dst) = dag.graph().edge_payloads(edge)?;
            let (Some(from), Some(to)) = (
                partition.scc_to_stage.get(&src).copied(),
                partition.scc_to_stage.get(&dst).copied(),
            ) else {
                // Edges touching external SCCs do not constrain stages.
                continue;
            };
            if from == to {
                continue;
            }
            let from_node = partition.node_of(from)?;
            let to_node = partition.node_of(to)?;
            if partition.graph.fetch_edge(from_node, to_node).is_none() {
                let e = partition.graph.add_edge(from, to)?;
                partition.graph.set_edge_kind(e, DependenceKind::Undefined)?;
            }
        }
        Ok(partition)
    }

    fn node_of(&self, stage: StageId) -> Result<NodeId> {
        self.graph.fetch_node(stage).ok_or_else(|| {
            WeftError::invariant("Partition::node_of", format!("unknown stage {stage:?}"))
        })
    }

    pub fn num_stages(&self) -> usize {
        self.graph.num_nodes()
    }

    /// Live stage ids, id-ordered.
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.graph
            .internal_pairs()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    pub fn is_live(&self, stage: StageId) -> bool {
        self.graph.fetch_node(stage).is_some()
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.0 as usize]
    }

    pub fn stage_of_scc(&self, scc: SccId) -> Option<StageId> {
        self.scc_to_stage.get(&scc).copied()
    }

    /// Stages this stage's consumers live in.
    pub fn dependent_ids(&self, stage: StageId) -> Result<Vec<StageId>> {
        let node = self.node_of(stage)?;
        self.graph
            .successors(node)
            .into_iter()
            .map(|n| self.graph.payload(n))
            .collect()
    }

    /// Stages that share a producer with this stage.
    pub fn sibling_ids(&self, stage: StageId) -> Result<Vec<StageId>> {
        let node = self.node_of(stage)?;
        let mut siblings: BTreeSet<NodeId> = BTreeSet::new();
        for pred in self.graph.predecessors(node) {
            for child in self.graph.successors(pred) {
                if child != node {
                    siblings.insert(child);
                }
            }
        }
        siblings
            .into_iter()
            .map(|n| self.graph.payload(n))
            .collect()
    }

    pub fn stages_with_no_incoming_edges(&self) -> Vec<StageId> {
        self.graph
            .top_level_nodes(true)
            .into_iter()
            .filter_map(|n| self.graph.payload(n).ok())
            .collect()
    }

    /// The set of stages a merge of `a` and `b` must collapse to keep the
    /// stage graph acyclic: the pair plus every stage on a directed path
    /// between them, in either direction.
    pub fn cycle_introduced_by_merging(&self, a: StageId, b: StageId) -> Result<BTreeSet<StageId>> {
        let na = self.node_of(a)?;
        let nb = self.node_of(b)?;
        let mut set: BTreeSet<StageId> = [a, b].into_iter().collect();
        for (from, to) in [(na, nb), (nb, na)] {
            let forward = self.reachable_from(from);
            let backward = self.reaching_to(to);
            for n in forward.intersection(&backward) {
                set.insert(self.graph.payload(*n)?);
            }
        }
        Ok(set)
    }

    /// Whether `a` and `b` can be merged while preserving acyclicity. The
    /// forced co-merge set is convex in the stage DAG, so collapsing it
    /// can never leave a residual cycle; the query fails only on unknown
    /// stages.
    pub fn can_merge(&self, a: StageId, b: StageId) -> bool {
        self.is_live(a) && self.is_live(b)
    }

    /// Whether merging exactly `{a, b}` would drag other stages along.
    pub fn merge_requires_others(&self, a: StageId, b: StageId) -> Result<bool> {
        Ok(self.cycle_introduced_by_merging(a, b)?.len() > 2)
    }

    /// Merge `a`, `b`, and their forced co-mergees into one stage.
    /// Merging a stage with itself is a no-op.
    pub fn merge(&mut self, a: StageId, b: StageId) -> Result<StageId> {
        if a == b {
            self.node_of(a)?;
            return Ok(a);
        }
        let group = self.cycle_introduced_by_merging(a, b)?;
        self.merge_group(&group)
    }

    fn merge_group(&mut self, group: &BTreeSet<StageId>) -> Result<StageId> {
        let nodes: BTreeSet<NodeId> = group
            .iter()
            .map(|s| self.node_of(*s))
            .collect::<Result<_>>()?;

        let mut merged_sccs: BTreeSet<SccId> = BTreeSet::new();
        for s in group {
            merged_sccs.extend(self.stage(*s).sccs.iter().copied());
        }

        // Record the surviving neighbors before removal.
        let mut out_peers: BTreeSet<NodeId> = BTreeSet::new();
        let mut in_peers: BTreeSet<NodeId> = BTreeSet::new();
        for n in &nodes {
            for succ in self.graph.successors(*n) {
                if !nodes.contains(&succ) {
                    out_peers.insert(succ);
                }
            }
            for pred in self.graph.predecessors(*n) {
                if !nodes.contains(&pred) {
                    in_peers.insert(pred);
                }
            }
        }

        for n in &nodes {
            self.graph.remove_node(*n);
        }

        let merged_id = StageId(self.stages.len() as u32);
        for scc in &merged_sccs {
            self.scc_to_stage.insert(*scc, merged_id);
        }
        self.stages.push(Stage { sccs: merged_sccs });
        let merged_node = self.graph.add_node(merged_id, true)?;

        for peer in out_peers {
            let peer_id = self.graph.payload(peer)?;
            if self.graph.fetch_edge(merged_node, peer).is_none() {
                let e = self.graph.add_edge(merged_id, peer_id)?;
                self.graph.set_edge_kind(e, DependenceKind::Undefined)?;
            }
        }
        for peer in in_peers {
            let peer_id = self.graph.payload(peer)?;
            if self.graph.fetch_edge(peer, merged_node).is_none() {
                let e = self.graph.add_edge(peer_id, merged_id)?;
                self.graph.set_edge_kind(e, DependenceKind::Undefined)?;
            }
        }

        self.verify_acyclic()?;
        Ok(merged_id)
    }

    fn reachable_from(&self, start: NodeId) -> BTreeSet<NodeId> {
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        let mut worklist = VecDeque::new();
        worklist.push_back(start);
        while let Some(n) = worklist.pop_front() {
            for succ in self.graph.successors(n) {
                if succ != start && seen.insert(succ) {
                    worklist.push_back(succ);
                }
            }
        }
        seen
    }

    fn reaching_to(&self, end: NodeId) -> BTreeSet<NodeId> {
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        let mut worklist = VecDeque::new();
        worklist.push_back(end);
        while let Some(n) = worklist.pop_front() {
            for pred in self.graph.predecessors(n) {
                if pred != end && seen.insert(pred) {
                    worklist.push_back(pred);
                }
            }
        }
        seen
    }

    /// I7: the stage graph must stay acyclic after every merge.
    pub fn verify_acyclic(&self) -> Result<()> {
        let nodes = self.graph.nodes();
        let mut in_degree: HashMap<NodeId, usize> = nodes
            .iter()
            .map(|n| {
                let d = self
                    .graph
                    .incoming_edges(*n)
                    .into_iter()
                    .filter(|e| {
                        let (src, _) = self.graph.edge_endpoints(*e).expect("live edge");
                        src != *n
                    })
                    .count();
                (*n, d)
            })
            .collect();
        let mut ready: Vec<NodeId> = nodes
            .iter()
            .copied()
            .filter(|n| in_degree[n] == 0)
            .collect();
        let mut seen = 0usize;
        while let Some(n) = ready.pop() {
            seen += 1;
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
        if seen != nodes.len() {
            return Err(WeftError::invariant(
                "Partition::verify_acyclic",
                "stage graph contains a cycle",
            ));
        }
        Ok(())
    }

    /// Which stages have instructions in which basic block; consumed by
    /// downstream schedulers that pack a stage's instructions together.
    pub fn stage_presence_by_block(
        &self,
        dag: &SccDag,
        module: &Module,
    ) -> BTreeMap<(FunctionId, BlockId), BTreeSet<StageId>> {
        let mut map: BTreeMap<(FunctionId, BlockId), BTreeSet<StageId>> = BTreeMap::new();
        for stage in self.stage_ids() {
            for scc in &self.stage(stage).sccs {
                for v in dag.scc(*scc).internal_values() {
                    if let Some(inst) = module.inst(v) {
                        map.entry((inst.function, inst.block))
                            .or_default()
                            .insert(stage);
                    }
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataKind;
    use crate::ir::ValueId;
    use crate::pdg::Pdg;

    /// A linear PDG a -> b -> c, one value each.
    fn chain_partition() -> (Pdg, SccDag, Partition) {
        let mut g = DepGraph::new();
        for i in 0..3 {
            g.add_node(ValueId(i), true).unwrap();
        }
        for (a, b) in [(0, 1), (1, 2)] {
            let e = g.add_edge(ValueId(a), ValueId(b)).unwrap();
            g.set_data_dependence(e, DataKind::Raw, false, true).unwrap();
        }
        let pdg = Pdg::from_graph(g);
        let dag = SccDag::from_pdg(&pdg).unwrap();
        let partition = Partition::new(&dag).unwrap();
        (pdg, dag, partition)
    }

    #[test]
    fn test_initial_partition_one_stage_per_scc() {
        let (_, dag, partition) = chain_partition();
        assert_eq!(partition.num_stages(), dag.num_internal_sccs());
        assert_eq!(partition.stages_with_no_incoming_edges().len(), 1);
    }

    #[test]
    fn test_merging_endpoints_collapses_middle() {
        let (_, dag, mut partition) = chain_partition();
        let stage_of = |p: &Partition, v: u32| {
            p.stage_of_scc(dag.scc_of_value(ValueId(v)).unwrap()).unwrap()
        };
        let a = stage_of(&partition, 0);
        let c = stage_of(&partition, 2);
        assert!(partition.can_merge(a, c));
        let group = partition.cycle_introduced_by_merging(a, c).unwrap();
        assert_eq!(group.len(), 3, "the middle stage is a forced co-mergee");

        let merged = partition.merge(a, c).unwrap();
        assert_eq!(partition.num_stages(), 1);
        assert_eq!(partition.stage(merged).sccs.len(), 3);
        partition.verify_acyclic().unwrap();
    }

    #[test]
    fn test_adjacent_merge_keeps_other_stage() {
        let (_, dag, mut partition) = chain_partition();
        let a = partition
            .stage_of_scc(dag.scc_of_value(ValueId(0)).unwrap())
            .unwrap();
        let b = partition
            .stage_of_scc(dag.scc_of_value(ValueId(1)).unwrap())
            .unwrap();
        assert!(!partition.merge_requires_others(a, b).unwrap());
        let merged = partition.merge(a, b).unwrap();
        assert_eq!(partition.num_stages(), 2);
        assert_eq!(partition.dependent_ids(merged).unwrap().len(), 1);
        partition.verify_acyclic().unwrap();
    }

    #[test]
    fn test_self_merge_is_noop() {
        let (_, dag, mut partition) = chain_partition();
        let a = partition
            .stage_of_scc(dag.scc_of_value(ValueId(0)).unwrap())
            .unwrap();
        assert!(partition.can_merge(a, a));
        let merged = partition.merge(a, a).unwrap();
        assert_eq!(merged, a);
        assert_eq!(partition.num_stages(), 3);
    }

    #[test]
    fn test_siblings_share_a_producer() {
        // Fan-out: a -> b, a -> c.
        let mut g = DepGraph::new();
        for i in 0..3 {
            g.add_node(ValueId(i), true).unwrap();
        }
        for (a, b) in [(0, 1), (0, 2)] {
            let e = g.add_edge(ValueId(a), ValueId(b)).unwrap();
            g.set_data_dependence(e, DataKind::Raw, false, true).unwrap();
        }
        let pdg = Pdg::from_graph(g);
        let dag = SccDag::from_pdg(&pdg).unwrap();
        let partition = Partition::new(&dag).unwrap();
        let b = partition
            .stage_of_scc(dag.scc_of_value(ValueId(1)).unwrap())
            .unwrap();
        let c = partition
            .stage_of_scc(dag.scc_of_value(ValueId(2)).unwrap())
            .unwrap();
        assert_eq!(partition.sibling_ids(b).unwrap(), vec![c]);
    }
}
