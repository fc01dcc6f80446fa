//! Program Dependence Graph
//!
//! A [`Pdg`] is a [`DepGraph`] over IR values: one node per function
//! argument and per instruction, and three edge families (register
//! def-use dependences, memory dependences derived from an alias oracle,
//! and control dependences derived from post-dominance). Construction lives
//! in [`builder`]; the optional parallelization-oriented edge elimination
//! lives in [`refine`].

pub mod builder;
pub mod refine;

pub use builder::{PdgBuilder, PdgOptions};

use crate::graph::DepGraph;
use crate::ir::{FunctionId, Module, Value, ValueId};
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

/// A dependence graph whose payloads are IR values.
pub struct Pdg {
    graph: DepGraph<ValueId>,
}

impl Deref for Pdg {
    type Target = DepGraph<ValueId>;

    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

impl DerefMut for Pdg {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.graph
    }
}

impl Pdg {
    /// Wrap an already-populated value graph. Useful when a caller builds
    /// dependences from a source other than [`builder::PdgBuilder`].
    pub fn from_graph(graph: DepGraph<ValueId>) -> Self {
        Pdg { graph }
    }

    pub fn graph(&self) -> &DepGraph<ValueId> {
        &self.graph
    }

    /// Internal values, id-ordered.
    pub fn internal_values(&self) -> Vec<ValueId> {
        self.graph.internal_pairs().into_iter().map(|(v, _)| v).collect()
    }

    /// Extract the subgraph whose internal nodes are exactly the arguments
    /// and instructions of `function`. Values outside the function that
    /// edges cross into are carried as externals.
    pub fn subgraph_for_function(&self, module: &Module, function: FunctionId) -> Pdg {
        let mut wanted: BTreeSet<ValueId> = BTreeSet::new();
        wanted.extend(module.function(function).params.iter().copied());
        wanted.extend(module.instructions_of(function));
        let entry = module.entry_instruction(function);
        self.subgraph_for_values(&wanted, entry)
    }

    /// Extract the subgraph whose internal nodes are the instructions of
    /// one loop of `function`.
    pub fn subgraph_for_loop(
        &self,
        module: &Module,
        function: FunctionId,
        loop_blocks: &BTreeSet<crate::ir::BlockId>,
    ) -> Pdg {
        let f = module.function(function);
        let mut wanted: BTreeSet<ValueId> = BTreeSet::new();
        for b in loop_blocks {
            wanted.extend(f.block(*b).insts.iter().copied());
        }
        let entry = wanted.iter().next().copied();
        self.subgraph_for_values(&wanted, entry)
    }

    /// Extract the subgraph induced by an arbitrary value set. Requested
    /// values present in this graph become internal; endpoints of crossing
    /// edges become external, and the crossing edges are kept.
    pub fn subgraph_for_values(&self, values: &BTreeSet<ValueId>, entry: Option<ValueId>) -> Pdg {
        let mut sub = DepGraph::new();
        for v in values {
            if self.graph.is_in_graph(*v) {
                sub.fetch_or_add_node(*v, true);
            }
        }

        for edge in self.graph.edges() {
            let (src, dst) = self.graph.edge_payloads(edge).expect("live edge");
            let src_in = values.contains(&src) && sub.is_in_graph(src);
            let dst_in = values.contains(&dst) && sub.is_in_graph(dst);
            match (src_in, dst_in) {
                (true, true) => {
                    sub.copy_add_edge(&self.graph, edge).expect("endpoints present");
                }
                (true, false) if self.graph.is_in_graph(dst) => {
                    sub.fetch_or_add_node(dst, false);
                    sub.copy_add_edge(&self.graph, edge).expect("endpoints present");
                }
                (false, true) if self.graph.is_in_graph(src) => {
                    sub.fetch_or_add_node(src, false);
                    sub.copy_add_edge(&self.graph, edge).expect("endpoints present");
                }
                _ => {}
            }
        }

        if let Some(entry) = entry {
            if let Some(node) = sub.fetch_node(entry) {
                if sub.is_internal(entry) {
                    sub.set_entry_node(node).expect("entry is internal");
                }
            }
        }
        Pdg::from_graph(sub)
    }

    /// Label a value for DOT and diagnostics output.
    pub fn value_label(module: &Module, value: ValueId) -> String {
        match module.value(value) {
            Value::Inst(inst) => format!("{value}: {:?}", kind_tag(&inst.kind)),
            Value::Argument { function, index } => {
                format!("{value}: arg{index} of {}", module.function(*function).name)
            }
            Value::ConstantInt(c) => format!("{value}: const {c}"),
            Value::Global(g) => format!("{value}: @{}", module.global(*g).name),
            Value::FunctionRef(f) => format!("{value}: &{}", module.function(*f).name),
        }
    }
}

fn kind_tag(kind: &crate::ir::InstKind) -> &'static str {
    use crate::ir::InstKind::*;
    match kind {
        Alloca { .. } => "alloca",
        Load { .. } => "load",
        Store { .. } => "store",
        Phi { .. } => "phi",
        Gep { .. } => "gep",
        Cast { .. } => "cast",
        Select { .. } => "select",
        Binary { .. } => "binop",
        Cmp { .. } => "cmp",
        Call { .. } => "call",
        Branch { .. } => "br",
        CondBranch { .. } => "cond_br",
        Return { .. } => "ret",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::alias::BaseObjectAliasOracle;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::Type;

    #[test]
    fn test_function_subgraph_round_trip() {
        let mut mb = ModuleBuilder::new("m");
        let g = mb.function("g", 1, Type::Int);
        let bg = mb.block(g);
        let one = mb.const_int(1);
        let sum = mb.add(g, bg, mb.param(g, 0), one);
        mb.ret(g, bg, Some(sum));

        let f = mb.function("main", 0, Type::Void);
        let bf = mb.block(f);
        let two = mb.const_int(2);
        mb.call_direct(f, bf, g, vec![two]);
        mb.ret(f, bf, None);
        let m = mb.finish();

        let pdg = PdgBuilder::from_module(&m, &BaseObjectAliasOracle, &PdgOptions::default())
            .expect("pdg builds");
        let sub = pdg.subgraph_for_function(&m, g);

        let mut expected: BTreeSet<ValueId> = BTreeSet::new();
        expected.extend(m.function(g).params.iter().copied());
        expected.extend(m.instructions_of(g));
        let got: BTreeSet<ValueId> = sub.internal_values().into_iter().collect();
        assert_eq!(got, expected);
    }
}
