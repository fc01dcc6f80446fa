//! Natural-loop detection and the loop forest
//!
//! A back-edge (tail -> header) where the header dominates the tail
//! identifies a natural loop; the body is the header plus every node that
//! reaches the tail without passing through the header. Loops sharing a
//! header are merged (one loop, several latches). Containment between
//! bodies induces the forest.

use super::dominators::DominatorSummary;
use super::{BlockId, FunctionId, Module, ValueId};
use std::collections::{BTreeSet, VecDeque};

/// Handle to a loop within its function's [`LoopForest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub usize);

/// One natural loop.
#[derive(Debug, Clone)]
pub struct LoopStructure {
    pub id: LoopId,
    pub header: BlockId,
    /// Sources of the back-edges into the header.
    pub latches: Vec<BlockId>,
    /// All blocks in the loop, header included.
    pub body: BTreeSet<BlockId>,
    /// The unique out-of-loop predecessor of the header, when there is one.
    pub preheader: Option<BlockId>,
    /// Out-of-loop successors of loop blocks.
    pub exit_blocks: Vec<BlockId>,
    /// (inside, outside) block pairs leaving the loop.
    pub exit_edges: Vec<(BlockId, BlockId)>,
    /// 0 for outermost loops, parents' level + 1 below.
    pub nesting_level: usize,
    pub parent: Option<LoopId>,
    pub children: Vec<LoopId>,
}

impl LoopStructure {
    pub fn contains_block(&self, block: BlockId) -> bool {
        self.body.contains(&block)
    }

    pub fn contains_inst(&self, module: &Module, value: ValueId) -> bool {
        module
            .inst(value)
            .is_some_and(|i| self.body.contains(&i.block))
    }

    /// Instructions of the loop, block order then listed order.
    pub fn instructions(&self, module: &Module, function: FunctionId) -> Vec<ValueId> {
        let f = module.function(function);
        let mut out = Vec::new();
        for b in &self.body {
            out.extend(f.block(*b).insts.iter().copied());
        }
        out
    }
}

/// The loops of one function, nested into a forest.
pub struct LoopForest {
    pub function: FunctionId,
    loops: Vec<LoopStructure>,
    roots: Vec<LoopId>,
}

impl LoopForest {
    /// Detect every natural loop of `function` and nest them.
    pub fn new(module: &Module, function: FunctionId, doms: &DominatorSummary) -> Self {
        let f = module.function(function);

        // Group back-edges by header; loops sharing a header are one loop.
        let mut headers: Vec<BlockId> = Vec::new();
        let mut latches_of: Vec<Vec<BlockId>> = Vec::new();
        for b in f.block_ids() {
            for succ in module.successors(function, b) {
                if doms.dominates_block(succ, b) {
                    match headers.iter().position(|h| *h == succ) {
                        Some(i) => latches_of[i].push(b),
                        None => {
                            headers.push(succ);
                            latches_of.push(vec![b]);
                        }
                    }
                }
            }
        }

        let mut loops: Vec<LoopStructure> = headers
            .iter()
            .zip(latches_of.iter())
            .enumerate()
            .map(|(idx, (header, latches))| {
                let body = loop_body(module, function, *header, latches);
                let mut structure = LoopStructure {
                    id: LoopId(idx),
                    header: *header,
                    latches: latches.clone(),
                    body,
                    preheader: None,
                    exit_blocks: Vec::new(),
                    exit_edges: Vec::new(),
                    nesting_level: 0,
                    parent: None,
                    children: Vec::new(),
                };
                fill_boundary(module, function, &mut structure);
                structure
            })
            .collect();

        // Parent = the smallest strictly-containing loop.
        for i in 0..loops.len() {
            let mut parent: Option<usize> = None;
            for j in 0..loops.len() {
                if i == j || !loops[j].body.contains(&loops[i].header) {
                    continue;
                }
                if loops[j].header == loops[i].header {
                    continue;
                }
                match parent {
                    Some(p) if loops[p].body.len() <= loops[j].body.len() => {}
                    _ => parent = Some(j),
                }
            }
            loops[i].parent = parent.map(LoopId);
        }
        for i in 0..loops.len() {
            if let Some(LoopId(p)) = loops[i].parent {
                loops[p].children.push(LoopId(i));
            }
        }
        let roots: Vec<LoopId> = loops
            .iter()
            .filter(|l| l.parent.is_none())
            .map(|l| l.id)
            .collect();

        // Nesting levels, outermost first.
        let mut worklist: VecDeque<LoopId> = roots.iter().copied().collect();
        while let Some(LoopId(i)) = worklist.pop_front() {
            let level = loops[i]
                .parent
                .map(|LoopId(p)| loops[p].nesting_level + 1)
                .unwrap_or(0);
            loops[i].nesting_level = level;
            worklist.extend(loops[i].children.iter().copied());
        }

        LoopForest {
            function,
            loops,
            roots,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn get(&self, id: LoopId) -> &LoopStructure {
        &self.loops[id.0]
    }

    pub fn all(&self) -> &[LoopStructure] {
        &self.loops
    }

    pub fn roots(&self) -> &[LoopId] {
        &self.roots
    }

    /// Direct children of a loop in the forest.
    pub fn children(&self, id: LoopId) -> Vec<&LoopStructure> {
        self.loops[id.0]
            .children
            .iter()
            .map(|c| &self.loops[c.0])
            .collect()
    }

    /// The innermost loop whose body contains `block`.
    pub fn innermost_containing_block(&self, block: BlockId) -> Option<LoopId> {
        self.loops
            .iter()
            .filter(|l| l.body.contains(&block))
            .max_by_key(|l| l.nesting_level)
            .map(|l| l.id)
    }

    /// The innermost loop containing an instruction value.
    pub fn innermost_containing_inst(&self, module: &Module, value: ValueId) -> Option<LoopId> {
        let inst = module.inst(value)?;
        if inst.function != self.function {
            return None;
        }
        self.innermost_containing_block(inst.block)
    }

    /// Whether `block` belongs to a loop nested strictly inside `of`.
    pub fn block_in_inner_loop(&self, of: LoopId, block: BlockId) -> bool {
        self.innermost_containing_block(block)
            .is_some_and(|inner| inner != of && self.is_ancestor(of, inner))
    }

    fn is_ancestor(&self, ancestor: LoopId, mut descendant: LoopId) -> bool {
        while let Some(parent) = self.loops[descendant.0].parent {
            if parent == ancestor {
                return true;
            }
            descendant = parent;
        }
        false
    }
}

/// Header plus everything reaching a latch without passing the header.
fn loop_body(
    module: &Module,
    function: FunctionId,
    header: BlockId,
    latches: &[BlockId],
) -> BTreeSet<BlockId> {
    let mut body = BTreeSet::new();
    let mut worklist: VecDeque<BlockId> = latches.iter().copied().collect();
    while let Some(block) = worklist.pop_front() {
        if block == header || body.contains(&block) {
            continue;
        }
        body.insert(block);
        for pred in module.predecessors(function, block) {
            if pred != header && !body.contains(&pred) {
                worklist.push_back(pred);
            }
        }
    }
    body.insert(header);
    body
}

fn fill_boundary(module: &Module, function: FunctionId, l: &mut LoopStructure) {
    for b in l.body.iter().copied() {
        for succ in module.successors(function, b) {
            if !l.body.contains(&succ) {
                l.exit_edges.push((b, succ));
                if !l.exit_blocks.contains(&succ) {
                    l.exit_blocks.push(succ);
                }
            }
        }
    }
    let outside_preds: Vec<BlockId> = module
        .predecessors(function, l.header)
        .into_iter()
        .filter(|p| !l.body.contains(p))
        .collect();
    if outside_preds.len() == 1 {
        l.preheader = Some(outside_preds[0]);
    }
}
