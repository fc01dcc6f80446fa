//! Dominator and post-dominator trees over a function CFG
//!
//! A node d dominates node n if every path from the entry to n must go
//! through d; post-dominance is the dual, computed by running the same
//! algorithm on the reversed CFG. Both trees are wrapped in a
//! [`DominatorSummary`] exposing block- and instruction-level queries.

use super::{BlockId, FunctionId, Module, ValueId};
use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Reversed;
use std::collections::HashMap;

/// A function CFG projected into petgraph, one node per basic block.
///
/// Functions with several return blocks get a synthetic sink node so the
/// post-dominator computation has a single root.
pub struct FunctionCfg {
    pub graph: DiGraph<BlockId, ()>,
    node_of: Vec<NodeIndex>,
    sink: Option<NodeIndex>,
}

impl FunctionCfg {
    pub fn new(module: &Module, function: FunctionId) -> Self {
        let f = module.function(function);
        let mut graph = DiGraph::new();
        let node_of: Vec<NodeIndex> = f.block_ids().map(|b| graph.add_node(b)).collect();
        for b in f.block_ids() {
            for succ in module.successors(function, b) {
                graph.add_edge(node_of[b.0 as usize], node_of[succ.0 as usize], ());
            }
        }

        let exits = module.exit_blocks(function);
        let sink = if exits.len() > 1 {
            // Synthetic sink so post-dominance has one root.
            let sink = graph.add_node(BlockId(u32::MAX));
            for e in &exits {
                graph.add_edge(node_of[e.0 as usize], sink, ());
            }
            Some(sink)
        } else {
            None
        };

        FunctionCfg {
            graph,
            node_of,
            sink,
        }
    }

    pub fn node(&self, block: BlockId) -> NodeIndex {
        self.node_of[block.0 as usize]
    }

    fn block(&self, node: NodeIndex) -> Option<BlockId> {
        let b = self.graph[node];
        (b.0 != u32::MAX).then_some(b)
    }
}

/// Dominator tree with cached immediate-dominator and children maps.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    root: NodeIndex,
    immediate_dominator: HashMap<NodeIndex, Option<NodeIndex>>,
    children: HashMap<NodeIndex, Vec<NodeIndex>>,
}

impl DominatorTree {
    fn from_root<G>(graph: G, root: NodeIndex, nodes: impl Iterator<Item = NodeIndex>) -> Self
    where
        G: petgraph::visit::GraphBase<NodeId = NodeIndex>
            + petgraph::visit::Visitable
            + petgraph::visit::IntoNeighbors,
    {
        let dominators = simple_fast(graph, root);
        let mut immediate_dominator = HashMap::new();
        let mut children: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for node in nodes {
            let idom = dominators.immediate_dominator(node);
            immediate_dominator.insert(node, idom);
            if let Some(parent) = idom {
                children.entry(parent).or_default().push(node);
            }
        }
        DominatorTree {
            root,
            immediate_dominator,
            children,
        }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// None for the root and for unreachable nodes.
    pub fn immediate_dominator(&self, node: NodeIndex) -> Option<NodeIndex> {
        self.immediate_dominator.get(&node).copied().flatten()
    }

    /// Every node dominates itself.
    pub fn dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        if a == b {
            return true;
        }
        let mut current = b;
        while let Some(idom) = self.immediate_dominator(current) {
            if idom == a {
                return true;
            }
            current = idom;
        }
        false
    }

    pub fn strictly_dominates(&self, a: NodeIndex, b: NodeIndex) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Nodes in the subtree rooted at `node`, including `node` itself.
    pub fn descendants(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut out = vec![node];
        let mut i = 0;
        while i < out.len() {
            if let Some(kids) = self.children.get(&out[i]) {
                out.extend(kids.iter().copied());
            }
            i += 1;
        }
        out
    }
}

/// Block- and instruction-level dominance queries for one function.
pub struct DominatorSummary {
    function: FunctionId,
    cfg: FunctionCfg,
    dom: Option<DominatorTree>,
    postdom: Option<DominatorTree>,
}

impl DominatorSummary {
    pub fn new(module: &Module, function: FunctionId) -> Self {
        let cfg = FunctionCfg::new(module, function);
        let f = module.function(function);

        let dom = f.entry_block().map(|entry| {
            DominatorTree::from_root(&cfg.graph, cfg.node(entry), cfg.graph.node_indices())
        });

        let postdom = {
            let exits = module.exit_blocks(function);
            let root = match (cfg.sink, exits.first()) {
                (Some(sink), _) => Some(sink),
                (None, Some(exit)) => Some(cfg.node(*exit)),
                (None, None) => None,
            };
            root.map(|root| {
                DominatorTree::from_root(Reversed(&cfg.graph), root, cfg.graph.node_indices())
            })
        };

        DominatorSummary {
            function,
            cfg,
            dom,
            postdom,
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn dominates_block(&self, a: BlockId, b: BlockId) -> bool {
        self.dom
            .as_ref()
            .is_some_and(|t| t.dominates(self.cfg.node(a), self.cfg.node(b)))
    }

    pub fn strictly_dominates_block(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates_block(a, b)
    }

    pub fn post_dominates_block(&self, a: BlockId, b: BlockId) -> bool {
        self.postdom
            .as_ref()
            .is_some_and(|t| t.dominates(self.cfg.node(a), self.cfg.node(b)))
    }

    pub fn strictly_post_dominates_block(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.post_dominates_block(a, b)
    }

    /// Blocks whose post-dominators include `block` (the post-dominator
    /// subtree), excluding the synthetic sink.
    pub fn post_dominated_descendants(&self, block: BlockId) -> Vec<BlockId> {
        let Some(tree) = self.postdom.as_ref() else {
            return vec![];
        };
        tree.descendants(self.cfg.node(block))
            .into_iter()
            .filter_map(|n| self.cfg.block(n))
            .collect()
    }

    /// Instruction-level dominance: block dominance, refined by listed
    /// order when both live in one block.
    pub fn dominates_inst(&self, module: &Module, a: ValueId, b: ValueId) -> bool {
        let (Some(ia), Some(ib)) = (module.inst(a), module.inst(b)) else {
            return false;
        };
        if ia.function != self.function || ib.function != self.function {
            return false;
        }
        if ia.block == ib.block {
            return a == b || module.precedes_in_block(a, b);
        }
        self.dominates_block(ia.block, ib.block)
    }
}
