//! Generic dependence multigraph
//!
//! [`DepGraph<T>`] is the substrate every analysis layer builds on: the PDG
//! is a `DepGraph<ValueId>`, an SCC is a `DepGraph<ValueId>` over its
//! members, the SCC DAG is a `DepGraph<SccId>`, and the stage partition is
//! a `DepGraph<StageId>`.
//!
//! Nodes wrap a payload of type `T` and are keyed by it: the graph keeps
//! two disjoint payload maps, *internal* (nodes the graph's owner created)
//! and *external* (live-ins/outs referenced by edges crossing the internal
//! set). Edges are typed ([`DependenceKind`]), may aggregate edges of a
//! lower layer as sub-edges, and carry loop-carried and removability
//! attributes.
//!
//! Nodes and edges live in graph-owned arenas; [`NodeId`]/[`EdgeId`] are
//! monotonically assigned per graph and never reused, so removal does not
//! disturb other handles. All query methods return collected, id-ordered
//! vectors rather than internal iterators.

pub mod dot;
pub mod edge;

pub use edge::{DataKind, DependenceKind};

use crate::error::{Result, WeftError};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;

/// Handle to a node of one [`DepGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Handle to an edge of one [`DepGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

struct NodeSlot<T> {
    payload: T,
    alive: bool,
    outgoing: BTreeSet<EdgeId>,
    incoming: BTreeSet<EdgeId>,
}

struct EdgeSlot {
    src: NodeId,
    dst: NodeId,
    kind: DependenceKind,
    alive: bool,
    loop_carried: bool,
    removable: bool,
    remedies: BTreeSet<String>,
    /// Edges of the next layer down that this edge aggregates.
    sub_edges: Vec<EdgeId>,
}

/// A directed multigraph of typed dependence edges over payloads of type
/// `T`, with internal/external node partitioning.
pub struct DepGraph<T> {
    nodes: Vec<NodeSlot<T>>,
    edges: Vec<EdgeSlot>,
    internal: HashMap<T, NodeId>,
    external: HashMap<T, NodeId>,
    entry: Option<NodeId>,
}

impl<T> Default for DepGraph<T> {
    fn default() -> Self {
        DepGraph {
            nodes: Vec::new(),
            edges: Vec::new(),
            internal: HashMap::new(),
            external: HashMap::new(),
            entry: None,
        }
    }
}

impl<T: Copy + Eq + Hash + Ord + Debug> DepGraph<T> {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- node and edge properties ----------------------------------------

    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.alive).count()
    }

    pub fn num_internal_nodes(&self) -> usize {
        self.internal.len()
    }

    pub fn num_external_nodes(&self) -> usize {
        self.external.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.iter().filter(|e| e.alive).count()
    }

    pub fn is_internal(&self, payload: T) -> bool {
        self.internal.contains_key(&payload)
    }

    pub fn is_external(&self, payload: T) -> bool {
        self.external.contains_key(&payload)
    }

    pub fn is_in_graph(&self, payload: T) -> bool {
        self.is_internal(payload) || self.is_external(payload)
    }

    pub fn entry_node(&self) -> Option<NodeId> {
        self.entry
    }

    /// The entry node's payload must be internal.
    pub fn set_entry_node(&mut self, node: NodeId) -> Result<()> {
        let payload = self.payload(node)?;
        if !self.is_internal(payload) {
            return Err(WeftError::invariant(
                "DepGraph::set_entry_node",
                format!("entry payload {payload:?} is not internal"),
            ));
        }
        self.entry = Some(node);
        Ok(())
    }

    pub fn payload(&self, node: NodeId) -> Result<T> {
        self.nodes
            .get(node.0 as usize)
            .filter(|n| n.alive)
            .map(|n| n.payload)
            .ok_or_else(|| {
                WeftError::invariant("DepGraph::payload", format!("unknown node {node:?}"))
            })
    }

    /// All live node handles, in id order.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.alive)
            .map(|(i, _)| NodeId(i as u32))
            .collect()
    }

    /// All live edge handles, in id order.
    pub fn edges(&self) -> Vec<EdgeId> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.alive)
            .map(|(i, _)| EdgeId(i as u32))
            .collect()
    }

    /// (payload, node) pairs of the internal map, payload-ordered.
    pub fn internal_pairs(&self) -> Vec<(T, NodeId)> {
        let mut pairs: Vec<_> = self.internal.iter().map(|(p, n)| (*p, *n)).collect();
        pairs.sort();
        pairs
    }

    /// (payload, node) pairs of the external map, payload-ordered.
    pub fn external_pairs(&self) -> Vec<(T, NodeId)> {
        let mut pairs: Vec<_> = self.external.iter().map(|(p, n)| (*p, *n)).collect();
        pairs.sort();
        pairs
    }

    // ---- fetching / creating nodes and edges -----------------------------

    /// Create a node for a payload not yet in the graph.
    pub fn add_node(&mut self, payload: T, internal: bool) -> Result<NodeId> {
        if self.is_in_graph(payload) {
            return Err(WeftError::invariant(
                "DepGraph::add_node",
                format!("payload {payload:?} already present"),
            ));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeSlot {
            payload,
            alive: true,
            outgoing: BTreeSet::new(),
            incoming: BTreeSet::new(),
        });
        if internal {
            self.internal.insert(payload, id);
        } else {
            self.external.insert(payload, id);
        }
        Ok(id)
    }

    /// Idempotent lookup-or-create. An existing node keeps its original
    /// internal/external placement.
    pub fn fetch_or_add_node(&mut self, payload: T, internal: bool) -> NodeId {
        if let Some(node) = self.fetch_node(payload) {
            return node;
        }
        self.add_node(payload, internal)
            .expect("payload checked absent")
    }

    pub fn fetch_node(&self, payload: T) -> Option<NodeId> {
        self.internal
            .get(&payload)
            .or_else(|| self.external.get(&payload))
            .copied()
    }

    /// Create an edge between payloads already present in the graph. The
    /// new edge is a register data dependence with all flags false; callers
    /// retag it with the `set_*` edge methods.
    pub fn add_edge(&mut self, src: T, dst: T) -> Result<EdgeId> {
        let src_node = self.fetch_node(src).ok_or_else(|| {
            WeftError::invariant("DepGraph::add_edge", format!("unknown source {src:?}"))
        })?;
        let dst_node = self.fetch_node(dst).ok_or_else(|| {
            WeftError::invariant("DepGraph::add_edge", format!("unknown destination {dst:?}"))
        })?;
        Ok(self.push_edge(src_node, dst_node, DependenceKind::variable()))
    }

    fn push_edge(&mut self, src: NodeId, dst: NodeId, kind: DependenceKind) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(EdgeSlot {
            src,
            dst,
            kind,
            alive: true,
            loop_carried: false,
            removable: false,
            remedies: BTreeSet::new(),
            sub_edges: Vec::new(),
        });
        self.nodes[src.0 as usize].outgoing.insert(id);
        self.nodes[dst.0 as usize].incoming.insert(id);
        id
    }

    /// Reparent a copy of an edge from another graph (or this one) into
    /// this graph, resolving the endpoints by payload. Kind, flags,
    /// sub-edges, and remedies are all copied.
    pub fn copy_add_edge(&mut self, from: &DepGraph<T>, edge: EdgeId) -> Result<EdgeId> {
        let slot = from.edge_slot(edge)?;
        let src_payload = from.payload(slot.src)?;
        let dst_payload = from.payload(slot.dst)?;
        let src_node = self.fetch_node(src_payload).ok_or_else(|| {
            WeftError::invariant(
                "DepGraph::copy_add_edge",
                format!("source payload {src_payload:?} not in destination graph"),
            )
        })?;
        let dst_node = self.fetch_node(dst_payload).ok_or_else(|| {
            WeftError::invariant(
                "DepGraph::copy_add_edge",
                format!("destination payload {dst_payload:?} not in destination graph"),
            )
        })?;
        let kind = slot.kind;
        let loop_carried = slot.loop_carried;
        let removable = slot.removable;
        let remedies = slot.remedies.clone();
        let sub_edges = slot.sub_edges.clone();
        let id = self.push_edge(src_node, dst_node, kind);
        let new = &mut self.edges[id.0 as usize];
        new.loop_carried = loop_carried;
        new.removable = removable;
        new.remedies = remedies;
        new.sub_edges = sub_edges;
        Ok(id)
    }

    fn edge_slot(&self, edge: EdgeId) -> Result<&EdgeSlot> {
        self.edges
            .get(edge.0 as usize)
            .filter(|e| e.alive)
            .ok_or_else(|| {
                WeftError::invariant("DepGraph::edge", format!("unknown edge {edge:?}"))
            })
    }

    fn edge_slot_mut(&mut self, edge: EdgeId) -> Result<&mut EdgeSlot> {
        self.edges
            .get_mut(edge.0 as usize)
            .filter(|e| e.alive)
            .ok_or_else(|| {
                WeftError::invariant("DepGraph::edge", format!("unknown edge {edge:?}"))
            })
    }

    /// First edge from `src` to `dst`, if any.
    pub fn fetch_edge(&self, src: NodeId, dst: NodeId) -> Option<EdgeId> {
        self.nodes.get(src.0 as usize).and_then(|n| {
            n.outgoing
                .iter()
                .find(|e| self.edges[e.0 as usize].dst == dst)
                .copied()
        })
    }

    /// Every edge between the two nodes, either direction.
    pub fn edges_between(&self, a: NodeId, b: NodeId) -> Vec<EdgeId> {
        let mut out: Vec<EdgeId> = self
            .edges()
            .into_iter()
            .filter(|e| {
                let slot = &self.edges[e.0 as usize];
                (slot.src == a && slot.dst == b) || (slot.src == b && slot.dst == a)
            })
            .collect();
        out.sort();
        out
    }

    // ---- edge attributes -------------------------------------------------

    pub fn edge_endpoints(&self, edge: EdgeId) -> Result<(NodeId, NodeId)> {
        let slot = self.edge_slot(edge)?;
        Ok((slot.src, slot.dst))
    }

    /// (source payload, destination payload) of an edge.
    pub fn edge_payloads(&self, edge: EdgeId) -> Result<(T, T)> {
        let (src, dst) = self.edge_endpoints(edge)?;
        Ok((self.payload(src)?, self.payload(dst)?))
    }

    pub fn edge_kind(&self, edge: EdgeId) -> Result<DependenceKind> {
        Ok(self.edge_slot(edge)?.kind)
    }

    pub fn set_edge_kind(&mut self, edge: EdgeId, kind: DependenceKind) -> Result<()> {
        self.edge_slot_mut(edge)?.kind = kind;
        Ok(())
    }

    /// Tag an edge as a memory/register data dependence, like the original
    /// combined mem-must-type setter.
    pub fn set_data_dependence(
        &mut self,
        edge: EdgeId,
        dep: DataKind,
        memory: bool,
        must: bool,
    ) -> Result<()> {
        self.set_edge_kind(edge, DependenceKind::Data { dep, memory, must })
    }

    pub fn set_control_dependence(&mut self, edge: EdgeId) -> Result<()> {
        self.set_edge_kind(edge, DependenceKind::Control)
    }

    pub fn is_loop_carried(&self, edge: EdgeId) -> Result<bool> {
        Ok(self.edge_slot(edge)?.loop_carried)
    }

    pub fn set_loop_carried(&mut self, edge: EdgeId, value: bool) -> Result<()> {
        self.edge_slot_mut(edge)?.loop_carried = value;
        Ok(())
    }

    pub fn set_removable(&mut self, edge: EdgeId, remedies: BTreeSet<String>) -> Result<()> {
        let slot = self.edge_slot_mut(edge)?;
        slot.removable = true;
        slot.remedies = remedies;
        Ok(())
    }

    pub fn is_removable(&self, edge: EdgeId) -> Result<bool> {
        Ok(self.edge_slot(edge)?.removable)
    }

    pub fn remedies(&self, edge: EdgeId) -> Result<&BTreeSet<String>> {
        Ok(&self.edge_slot(edge)?.remedies)
    }

    /// Attach a lower-layer edge to an aggregate edge. `sub_loop_carried`
    /// is the sub-edge's flag; the aggregate's flag is the monotonic OR of
    /// its sub-edges' flags.
    pub fn add_sub_edge(&mut self, edge: EdgeId, sub: EdgeId, sub_loop_carried: bool) -> Result<()> {
        let slot = self.edge_slot_mut(edge)?;
        if !slot.sub_edges.contains(&sub) {
            slot.sub_edges.push(sub);
        }
        slot.loop_carried |= sub_loop_carried;
        Ok(())
    }

    pub fn sub_edges(&self, edge: EdgeId) -> Result<&[EdgeId]> {
        Ok(&self.edge_slot(edge)?.sub_edges)
    }

    // ---- node adjacency --------------------------------------------------

    pub fn outgoing_edges(&self, node: NodeId) -> Vec<EdgeId> {
        self.nodes
            .get(node.0 as usize)
            .filter(|n| n.alive)
            .map(|n| n.outgoing.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn incoming_edges(&self, node: NodeId) -> Vec<EdgeId> {
        self.nodes
            .get(node.0 as usize)
            .filter(|n| n.alive)
            .map(|n| n.incoming.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn num_outgoing_edges(&self, node: NodeId) -> usize {
        self.nodes
            .get(node.0 as usize)
            .filter(|n| n.alive)
            .map(|n| n.outgoing.len())
            .unwrap_or(0)
    }

    pub fn num_incoming_edges(&self, node: NodeId) -> usize {
        self.nodes
            .get(node.0 as usize)
            .filter(|n| n.alive)
            .map(|n| n.incoming.len())
            .unwrap_or(0)
    }

    /// Distinct successor nodes, id-ordered.
    pub fn successors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out: BTreeSet<NodeId> = BTreeSet::new();
        for e in self.outgoing_edges(node) {
            out.insert(self.edges[e.0 as usize].dst);
        }
        out.into_iter().collect()
    }

    /// Distinct predecessor nodes, id-ordered.
    pub fn predecessors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out: BTreeSet<NodeId> = BTreeSet::new();
        for e in self.incoming_edges(node) {
            out.insert(self.edges[e.0 as usize].src);
        }
        out.into_iter().collect()
    }

    // ---- removal ---------------------------------------------------------

    /// Remove an edge from both endpoints and the graph. Unknown edges are
    /// an invariant violation.
    pub fn remove_edge(&mut self, edge: EdgeId) -> Result<()> {
        let slot = self.edge_slot(edge)?;
        let (src, dst) = (slot.src, slot.dst);
        self.nodes[src.0 as usize].outgoing.remove(&edge);
        self.nodes[dst.0 as usize].incoming.remove(&edge);
        self.edges[edge.0 as usize].alive = false;
        Ok(())
    }

    /// Remove a node and every incident edge. Unknown nodes are a no-op.
    pub fn remove_node(&mut self, node: NodeId) {
        let Some(slot) = self.nodes.get(node.0 as usize) else {
            return;
        };
        if !slot.alive {
            return;
        }
        let payload = slot.payload;
        let incident: Vec<EdgeId> = slot
            .outgoing
            .iter()
            .chain(slot.incoming.iter())
            .copied()
            .collect();
        for e in incident {
            // Self-loops appear in both sets; the second removal is a no-op.
            if self.edges[e.0 as usize].alive {
                self.remove_edge(e).expect("incident edge is alive");
            }
        }
        self.internal.remove(&payload);
        self.external.remove(&payload);
        self.nodes[node.0 as usize].alive = false;
        if self.entry == Some(node) {
            self.entry = None;
        }
    }

    // ---- structural queries ----------------------------------------------

    /// Nodes with no non-self incoming edges. With `only_internal`, edges
    /// from external nodes do not count either. If every node sits in a
    /// cycle, falls back to picking one node of a top cycle: the first node
    /// whose forward closure, on top of everything visited before it,
    /// covers the graph.
    pub fn top_level_nodes(&self, only_internal: bool) -> Vec<NodeId> {
        let mut top: Vec<NodeId> = Vec::new();
        for node in self.nodes() {
            let payload = self.nodes[node.0 as usize].payload;
            if only_internal && self.is_external(payload) {
                continue;
            }
            let mut no_other_incoming = true;
            for e in self.incoming_edges(node) {
                let src = self.edges[e.0 as usize].src;
                let edge_to_self = src == node;
                let edge_from_external =
                    only_internal && self.is_external(self.nodes[src.0 as usize].payload);
                no_other_incoming &= edge_to_self || edge_from_external;
            }
            if no_other_incoming {
                top.push(node);
            }
        }
        if !top.is_empty() {
            return top;
        }

        // Everything has a predecessor: the graph's top is a cycle. By the
        // time all nodes are visited, the node that completed the closure
        // must be in the top cycle.
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        if only_internal {
            for (_, node) in self.external_pairs() {
                visited.insert(node);
            }
        }
        let total = self.nodes().len();
        for node in self.nodes() {
            let payload = self.nodes[node.0 as usize].payload;
            if only_internal && self.is_external(payload) {
                continue;
            }
            if visited.contains(&node) {
                continue;
            }
            let mut worklist = VecDeque::new();
            worklist.push_back(node);
            while let Some(n) = worklist.pop_front() {
                visited.insert(n);
                for succ in self.successors(n) {
                    if !visited.contains(&succ) {
                        worklist.push_back(succ);
                    }
                }
            }
            if visited.len() == total {
                top.push(node);
                break;
            }
        }
        top
    }

    /// Nodes with no outgoing edges.
    pub fn leaf_nodes(&self, only_internal: bool) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .filter(|n| {
                if only_internal && self.is_external(self.nodes[n.0 as usize].payload) {
                    return false;
                }
                self.num_outgoing_edges(*n) == 0
            })
            .collect()
    }

    /// Partition of all live nodes into connected components of the
    /// undirected projection, BFS order within each component.
    pub fn disconnected_subgraphs(&self) -> Vec<Vec<NodeId>> {
        let mut components = Vec::new();
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        for node in self.nodes() {
            if visited.contains(&node) {
                continue;
            }
            let mut component = Vec::new();
            let mut worklist = VecDeque::new();
            visited.insert(node);
            worklist.push_back(node);
            while let Some(n) = worklist.pop_front() {
                component.push(n);
                for neighbor in self
                    .successors(n)
                    .into_iter()
                    .chain(self.predecessors(n))
                {
                    if visited.insert(neighbor) {
                        worklist.push_back(neighbor);
                    }
                }
            }
            components.push(component);
        }
        components
    }

    /// Successors of `node` that have no predecessor among the other
    /// successors: the next "level" when walking the graph one depth at a
    /// time.
    pub fn next_depth_nodes(&self, node: NodeId) -> Vec<NodeId> {
        let succs: BTreeSet<NodeId> = self.successors(node).into_iter().collect();
        succs
            .iter()
            .filter(|s| {
                self.predecessors(**s)
                    .iter()
                    .all(|p| !succs.contains(p))
            })
            .copied()
            .collect()
    }

    /// Predecessors of `node` with no successor among the other
    /// predecessors.
    pub fn previous_depth_nodes(&self, node: NodeId) -> Vec<NodeId> {
        let preds: BTreeSet<NodeId> = self.predecessors(node).into_iter().collect();
        preds
            .iter()
            .filter(|p| {
                self.successors(**p)
                    .iter()
                    .all(|s| !preds.contains(s))
            })
            .copied()
            .collect()
    }

    /// Clone the subgraph induced by `subset` into a new graph: nodes keep
    /// their internal/external placement, and only edges with both
    /// endpoints in the subset are copied. `entry`, when given, must be in
    /// the subset.
    pub fn copy_nodes_into_new_graph(
        &self,
        subset: &[NodeId],
        entry: Option<NodeId>,
    ) -> Result<DepGraph<T>> {
        let mut new = DepGraph::new();
        let chosen: BTreeSet<NodeId> = subset.iter().copied().collect();
        for node in &chosen {
            let payload = self.payload(*node)?;
            new.add_node(payload, self.is_internal(payload))?;
        }
        for node in &chosen {
            for e in self.outgoing_edges(*node) {
                let dst = self.edges[e.0 as usize].dst;
                if !chosen.contains(&dst) {
                    continue;
                }
                new.copy_add_edge(self, e)?;
            }
        }
        if let Some(entry) = entry {
            if !chosen.contains(&entry) {
                return Err(WeftError::invariant(
                    "DepGraph::copy_nodes_into_new_graph",
                    "entry node is not part of the copied subset".to_string(),
                ));
            }
            let payload = self.payload(entry)?;
            if let Some(node) = new.fetch_node(payload) {
                if new.is_internal(payload) {
                    new.set_entry_node(node)?;
                }
            }
        }
        Ok(new)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.internal.clear();
        self.external.clear();
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (DepGraph<u32>, [NodeId; 3]) {
        let mut g = DepGraph::new();
        let a = g.add_node(1, true).unwrap();
        let b = g.add_node(2, true).unwrap();
        let c = g.add_node(3, true).unwrap();
        g.add_edge(1, 2).unwrap();
        g.add_edge(2, 3).unwrap();
        (g, [a, b, c])
    }

    #[test]
    fn test_add_edge_requires_known_endpoints() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, true).unwrap();
        let err = g.add_edge(1, 99).unwrap_err();
        assert!(matches!(err, WeftError::InvariantViolation { .. }));
    }

    #[test]
    fn test_duplicate_add_node_rejected() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, true).unwrap();
        assert!(g.add_node(1, false).is_err());
        // But fetch_or_add is idempotent.
        let n = g.fetch_or_add_node(1, false);
        assert_eq!(g.payload(n).unwrap(), 1);
        assert!(g.is_internal(1));
        assert!(!g.is_external(1));
    }

    #[test]
    fn test_incidence_is_consistent() {
        let (g, [a, b, c]) = chain();
        assert_eq!(g.num_outgoing_edges(a), 1);
        assert_eq!(g.num_incoming_edges(b), 1);
        assert_eq!(g.num_outgoing_edges(b), 1);
        assert_eq!(g.num_incoming_edges(c), 1);
        assert_eq!(g.successors(a), vec![b]);
        assert_eq!(g.predecessors(c), vec![b]);
    }

    #[test]
    fn test_remove_node_destroys_incident_edges() {
        let (mut g, [a, b, c]) = chain();
        g.remove_node(b);
        assert_eq!(g.num_nodes(), 2);
        assert_eq!(g.num_edges(), 0);
        assert_eq!(g.num_outgoing_edges(a), 0);
        assert_eq!(g.num_incoming_edges(c), 0);
        // Removing again is a no-op.
        g.remove_node(b);
        assert_eq!(g.num_nodes(), 2);
    }

    #[test]
    fn test_remove_unknown_edge_fails() {
        let (mut g, _) = chain();
        let e = g.edges()[0];
        g.remove_edge(e).unwrap();
        assert!(g.remove_edge(e).is_err());
    }

    #[test]
    fn test_top_level_ignores_self_loops() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, true).unwrap();
        g.add_edge(1, 1).unwrap();
        let top = g.top_level_nodes(false);
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn test_top_level_cycle_fallback() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, true).unwrap();
        g.add_node(2, true).unwrap();
        g.add_edge(1, 2).unwrap();
        g.add_edge(2, 1).unwrap();
        // No node is edge-free; the fallback picks one node of the cycle.
        let top = g.top_level_nodes(false);
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn test_top_level_only_internal_discounts_external_edges() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, false).unwrap();
        g.add_node(2, true).unwrap();
        g.add_edge(1, 2).unwrap();
        let top = g.top_level_nodes(true);
        assert_eq!(top.len(), 1);
        assert_eq!(g.payload(top[0]).unwrap(), 2);
    }

    #[test]
    fn test_disconnected_subgraphs() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, true).unwrap();
        g.add_node(2, true).unwrap();
        g.add_node(3, true).unwrap();
        g.add_node(4, true).unwrap();
        g.add_edge(1, 2).unwrap();
        g.add_edge(4, 3).unwrap();
        let components = g.disconnected_subgraphs();
        assert_eq!(components.len(), 2);
        assert_eq!(components.iter().map(|c| c.len()).sum::<usize>(), 4);
    }

    #[test]
    fn test_next_depth_skips_nodes_fed_by_siblings() {
        // a -> b, a -> c, b -> c: the next depth of a is {b} only.
        let mut g: DepGraph<u32> = DepGraph::new();
        let a = g.add_node(1, true).unwrap();
        let b = g.add_node(2, true).unwrap();
        let c = g.add_node(3, true).unwrap();
        g.add_edge(1, 2).unwrap();
        g.add_edge(1, 3).unwrap();
        g.add_edge(2, 3).unwrap();
        assert_eq!(g.next_depth_nodes(a), vec![b]);
        assert_eq!(g.previous_depth_nodes(c), vec![b]);
    }

    #[test]
    fn test_copy_subgraph_keeps_induced_edges_only() {
        let (g, [a, b, _c]) = chain();
        let sub = g.copy_nodes_into_new_graph(&[a, b], Some(a)).unwrap();
        assert_eq!(sub.num_nodes(), 2);
        assert_eq!(sub.num_edges(), 1);
        assert!(sub.is_internal(1) && sub.is_internal(2));
        assert!(!sub.is_in_graph(3));
        let entry = sub.entry_node().unwrap();
        assert_eq!(sub.payload(entry).unwrap(), 1);
    }

    #[test]
    fn test_copy_add_edge_preserves_attributes() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, true).unwrap();
        g.add_node(2, true).unwrap();
        let e = g.add_edge(1, 2).unwrap();
        g.set_data_dependence(e, DataKind::Waw, true, true).unwrap();
        g.set_loop_carried(e, true).unwrap();

        let mut h: DepGraph<u32> = DepGraph::new();
        h.add_node(1, true).unwrap();
        h.add_node(2, false).unwrap();
        let copied = h.copy_add_edge(&g, e).unwrap();
        assert!(h.edge_kind(copied).unwrap().is_waw());
        assert!(h.edge_kind(copied).unwrap().is_memory());
        assert!(h.is_loop_carried(copied).unwrap());
    }

    #[test]
    fn test_sub_edge_or_is_monotonic() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, true).unwrap();
        g.add_node(2, true).unwrap();
        let e = g.add_edge(1, 2).unwrap();
        g.add_sub_edge(e, EdgeId(10), false).unwrap();
        assert!(!g.is_loop_carried(e).unwrap());
        g.add_sub_edge(e, EdgeId(11), true).unwrap();
        assert!(g.is_loop_carried(e).unwrap());
        // A later non-carried sub-edge does not clear the flag.
        g.add_sub_edge(e, EdgeId(12), false).unwrap();
        assert!(g.is_loop_carried(e).unwrap());
        assert_eq!(g.sub_edges(e).unwrap().len(), 3);
    }

    #[test]
    fn test_entry_node_must_be_internal() {
        let mut g: DepGraph<u32> = DepGraph::new();
        let ext = g.add_node(1, false).unwrap();
        assert!(g.set_entry_node(ext).is_err());
        let int = g.add_node(2, true).unwrap();
        g.set_entry_node(int).unwrap();
        assert_eq!(g.entry_node(), Some(int));
    }

    #[test]
    fn test_parallel_edges_are_kept_apart() {
        let mut g: DepGraph<u32> = DepGraph::new();
        g.add_node(1, true).unwrap();
        g.add_node(2, true).unwrap();
        let e1 = g.add_edge(1, 2).unwrap();
        let e2 = g.add_edge(1, 2).unwrap();
        g.set_data_dependence(e1, DataKind::Raw, true, false).unwrap();
        g.set_control_dependence(e2).unwrap();
        assert_eq!(g.num_edges(), 2);
        assert!(g.edge_kind(e1).unwrap().is_memory());
        assert!(g.edge_kind(e2).unwrap().is_control());
    }
}
