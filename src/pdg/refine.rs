//! Parallelization-oriented edge elimination
//!
//! Two classes of memory edges are provably uninteresting to the loop
//! parallelization schemes and can be dropped from the PDG:
//!
//! 1. load/store pairs on the same induction-variable-governed address
//!    (or on provably different primitive arrays) where the producer
//!    cannot reach the consumer without crossing the loop header, so the
//!    next iteration touches a different element;
//! 2. edges kept alive only by calls to functions that never write memory
//!    (memoryless bodies, read-only externals).
//!
//! Both eliminations are independently toggleable and scoped to functions
//! reachable from the entry point.

use super::Pdg;
use crate::diagnostics::Verbosity;
use crate::graph::EdgeId;
use crate::ir::callgraph::CallGraph;
use crate::ir::dominators::DominatorSummary;
use crate::ir::loops::LoopForest;
use crate::ir::scev::ScalarEvolution;
use crate::ir::{
    classify_external, Callee, ExternalKind, FunctionId, InstKind, Module, Type, Value, ValueId,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::debug;

/// Which eliminations run. Both default to off; `parallelizer()` enables
/// the full set the parallelization schemes rely on.
#[derive(Debug, Clone, Default)]
pub struct RefineOptions {
    pub drop_same_iv_gep_backedges: bool,
    pub drop_memoryless_call_edges: bool,
    pub verbosity: Verbosity,
}

impl RefineOptions {
    pub fn parallelizer() -> Self {
        RefineOptions {
            drop_same_iv_gep_backedges: true,
            drop_memoryless_call_edges: true,
            verbosity: Verbosity::Disabled,
        }
    }
}

/// Remove edges not used by the parallelization schemes. Returns the
/// number of edges dropped.
pub fn remove_edges_not_used_by_parallel_schemes(
    pdg: &mut Pdg,
    module: &Module,
    call_graph: &CallGraph,
    options: &RefineOptions,
) -> usize {
    let ctx = RefineContext::new(module, call_graph);
    let mut to_remove: Vec<EdgeId> = Vec::new();

    for edge in pdg.edges() {
        let (src, _) = pdg.edge_payloads(edge).expect("live edge");
        let Some(src_inst) = module.inst(src) else {
            continue;
        };
        if !ctx.cg_under_entry.contains(&src_inst.function) {
            continue;
        }
        let drop = (options.drop_same_iv_gep_backedges
            && ctx.edge_is_not_loop_carried_memory_dependency(pdg, edge))
            || (options.drop_memoryless_call_edges
                && ctx.edge_is_along_non_memory_writing_functions(pdg, edge));
        if drop {
            to_remove.push(edge);
        }
    }

    for edge in &to_remove {
        if options.verbosity >= Verbosity::Maximal {
            let (src, dst) = pdg.edge_payloads(*edge).expect("live edge");
            debug!(%src, %dst, "memory dependence removed");
        }
        pdg.remove_edge(*edge).expect("edge collected alive");
    }
    to_remove.len()
}

struct RefineContext<'a> {
    module: &'a Module,
    cg_under_entry: BTreeSet<FunctionId>,
    memoryless: BTreeSet<FunctionId>,
    primitive_array_locals: BTreeSet<ValueId>,
    primitive_array_globals: BTreeSet<ValueId>,
    forests: HashMap<FunctionId, LoopForest>,
}

impl<'a> RefineContext<'a> {
    fn new(module: &'a Module, call_graph: &CallGraph) -> Self {
        let entry = module
            .function_named("main")
            .or_else(|| module.function_ids().next());
        let cg_under_entry = entry
            .map(|e| call_graph.functions_reachable_from(module, e))
            .unwrap_or_default();

        let mut forests = HashMap::new();
        for f in &cg_under_entry {
            if !module.function(*f).is_empty() {
                let doms = DominatorSummary::new(module, *f);
                forests.insert(*f, LoopForest::new(module, *f, &doms));
            }
        }

        let mut ctx = RefineContext {
            module,
            memoryless: BTreeSet::new(),
            primitive_array_locals: BTreeSet::new(),
            primitive_array_globals: BTreeSet::new(),
            forests,
            cg_under_entry,
        };
        ctx.collect_memoryless_functions();
        ctx.collect_primitive_array_values();
        ctx
    }

    /// A function is memoryless when its body holds no load, store, or
    /// call and references no global.
    fn collect_memoryless_functions(&mut self) {
        'functions: for f in self.cg_under_entry.iter().copied() {
            let func = self.module.function(f);
            if func.is_empty() {
                continue;
            }
            for v in self.module.instructions_of(f) {
                let inst = self.module.inst(v).expect("instruction");
                if matches!(
                    inst.kind,
                    InstKind::Load { .. } | InstKind::Store { .. } | InstKind::Call { .. }
                ) {
                    continue 'functions;
                }
                for op in inst.operands() {
                    if matches!(self.module.value(op), Value::Global(_)) {
                        continue 'functions;
                    }
                }
            }
            self.memoryless.insert(f);
        }
    }

    /// Primitive arrays: local contiguous allocations and internal global
    /// arrays whose every use is understood (element access, read-only
    /// output, integer arithmetic that never lets the pointer escape).
    fn collect_primitive_array_values(&mut self) {
        let users = self.module.def_use();

        // Globals used only under the entry call graph.
        for g in self.module.global_ids() {
            let global = self.module.global(g);
            if global.external_linkage || !global.ty.is_array() {
                continue;
            }
            let Some(gv) = self.module.global_value(g) else {
                continue;
            };
            let used_under_entry = users.get(&gv).is_some_and(|us| {
                us.iter().any(|u| {
                    self.module
                        .inst(*u)
                        .is_some_and(|i| self.cg_under_entry.contains(&i.function))
                })
            });
            if used_under_entry && self.is_primitive_array(gv, &users) {
                self.primitive_array_globals.insert(gv);
            }
        }

        // Array-typed allocas.
        for f in self.cg_under_entry.iter().copied() {
            for v in self.module.instructions_of(f) {
                let inst = self.module.inst(v).expect("instruction");
                if matches!(inst.kind, InstKind::Alloca { allocated: Type::Array { .. } })
                    && self.is_primitive_array(v, &users)
                {
                    self.primitive_array_locals.insert(v);
                }
            }
        }

        // Heap allocations through the contiguous allocators.
        let mut allocator_calls: Vec<ValueId> = Vec::new();
        for f in self.cg_under_entry.iter().copied() {
            for v in self.module.instructions_of(f) {
                if let Some(InstKind::Call {
                    callee: Callee::External(name),
                    ..
                }) = self.module.inst(v).map(|i| &i.kind)
                {
                    if matches!(
                        classify_external(name),
                        ExternalKind::Malloc | ExternalKind::Calloc
                    ) {
                        allocator_calls.push(v);
                    }
                }
            }
        }
        for call in allocator_calls {
            if self.is_primitive_array(call, &users) {
                self.primitive_array_locals.insert(call);
            }
        }
    }

    fn is_primitive_array(&self, v: ValueId, users: &HashMap<ValueId, Vec<ValueId>>) -> bool {
        let Some(direct_users) = users.get(&v) else {
            return false;
        };
        direct_users.iter().all(|u| {
            let Some(inst) = self.module.inst(*u) else {
                return false;
            };
            match &inst.kind {
                InstKind::Cast { .. } => self.is_primitive_array(*u, users),
                InstKind::Gep { base, .. } if *base == v => {
                    self.value_does_not_escape(*u, users, &mut BTreeSet::new())
                }
                InstKind::Call {
                    callee: Callee::External(name),
                    ..
                } => classify_external(name) == ExternalKind::ReadOnly,
                _ => false,
            }
        })
    }

    /// An element pointer does not escape when every transitive user is
    /// local integer computation, element load/store, control flow, or an
    /// integer return.
    fn value_does_not_escape(
        &self,
        v: ValueId,
        users: &HashMap<ValueId, Vec<ValueId>>,
        checked: &mut BTreeSet<ValueId>,
    ) -> bool {
        if !checked.insert(v) {
            return true;
        }
        let Some(direct_users) = users.get(&v) else {
            return true;
        };
        for u in direct_users {
            let Some(inst) = self.module.inst(*u) else {
                return false;
            };
            let ok = match &inst.kind {
                InstKind::Branch { .. } | InstKind::CondBranch { .. } => true,
                InstKind::Return { .. } => inst.ty.is_int() || {
                    // Returning an integer derived from the value is fine;
                    // returning the pointer itself is an escape.
                    !matches!(self.module.value(v), Value::Inst(i) if i.ty.is_ptr())
                },
                InstKind::Load { .. } => {
                    inst.ty.is_int() && self.value_does_not_escape(*u, users, checked)
                }
                InstKind::Store { value, ptr } => {
                    // Storing through the pointer is fine when the stored
                    // value is integer data; storing the pointer itself is
                    // an escape.
                    *ptr == v && *value != v && {
                        match self.module.value(*value) {
                            Value::ConstantInt(_) => true,
                            Value::Inst(i) => i.ty.is_int(),
                            _ => false,
                        }
                    }
                }
                InstKind::Cmp { .. } | InstKind::Binary { .. } | InstKind::Cast { .. } => {
                    inst.ty.is_int() && self.value_does_not_escape(*u, users, checked)
                }
                InstKind::Gep { base, .. } => {
                    *base == v && self.value_does_not_escape(*u, users, checked)
                }
                InstKind::Phi { .. } | InstKind::Select { .. } => {
                    self.value_does_not_escape(*u, users, checked)
                }
                InstKind::Call {
                    callee: Callee::External(name),
                    ..
                } => classify_external(name) == ExternalKind::ReadOnly,
                _ => false,
            };
            if !ok {
                return false;
            }
        }
        true
    }

    // ---- class 1: not-loop-carried memory accesses ------------------------

    fn edge_is_not_loop_carried_memory_dependency(&self, pdg: &Pdg, edge: EdgeId) -> bool {
        let kind = pdg.edge_kind(edge).expect("live edge");
        if !kind.is_memory() {
            return false;
        }
        let (src, dst) = pdg.edge_payloads(edge).expect("live edge");
        let (Some(src_inst), Some(dst_inst)) = (self.module.inst(src), self.module.inst(dst))
        else {
            return false;
        };
        if matches!(src_inst.kind, InstKind::Call { .. })
            || matches!(dst_inst.kind, InstKind::Call { .. })
        {
            return false;
        }

        // Identify the load/store orientation.
        let (load, store) = if kind.is_war() {
            (Some(src), Some(dst))
        } else if kind.is_raw() {
            (Some(dst), Some(src))
        } else {
            (None, None)
        };

        if self.accesses_different_arrays(src, dst) {
            return true;
        }
        if let (Some(load), Some(store)) = (load, store) {
            if self.is_backedge_of_same_offset_access(src, dst, load, store) {
                return true;
            }
        }
        self.is_backedge_into_same_global(src, dst)
    }

    /// (array, governing gep) of a memory access, when the pointer roots at
    /// a recognized primitive array.
    fn primitive_array_access(
        &self,
        v: ValueId,
        must_be_iv_governed: bool,
    ) -> Option<(ValueId, Option<ValueId>)> {
        let mem_op = self.module.inst(v)?.pointer_operand()?;
        let stripped = self.strip_casts(mem_op);
        if self.is_recognized_array(stripped) {
            return Some((stripped, None));
        }

        let gep_inst = self.module.inst(stripped)?;
        let InstKind::Gep { base, .. } = &gep_inst.kind else {
            return None;
        };
        if must_be_iv_governed && !self.gep_indices_constant_or_iv(stripped) {
            return None;
        }
        let base = self.strip_casts(*base);
        if self.primitive_array_locals.contains(&base)
            || self.primitive_array_globals.contains(&base)
        {
            return Some((base, Some(stripped)));
        }
        // A GEP on a load of a global array pointer.
        if let Some(InstKind::Load { ptr }) = self.module.inst(base).map(|i| &i.kind) {
            let root = self.strip_casts(*ptr);
            if self.primitive_array_globals.contains(&root) {
                return Some((root, Some(stripped)));
            }
        }
        None
    }

    fn strip_casts(&self, mut v: ValueId) -> ValueId {
        while let Some(InstKind::Cast { operand }) = self.module.inst(v).map(|i| &i.kind) {
            v = *operand;
        }
        v
    }

    fn is_recognized_array(&self, v: ValueId) -> bool {
        self.primitive_array_locals.contains(&v) || self.primitive_array_globals.contains(&v)
    }

    fn accesses_different_arrays(&self, a: ValueId, b: ValueId) -> bool {
        let array_a = self.primitive_array_access(a, false).map(|(arr, _)| arr);
        let array_b = self.primitive_array_access(b, false).map(|(arr, _)| arr);
        matches!((array_a, array_b), (Some(x), Some(y)) if x != y)
    }

    fn is_backedge_of_same_offset_access(
        &self,
        src: ValueId,
        dst: ValueId,
        load: ValueId,
        store: ValueId,
    ) -> bool {
        let Some((_, Some(gep1))) = self.primitive_array_access(load, true) else {
            return false;
        };
        let Some((_, Some(gep2))) = self.primitive_array_access(store, true) else {
            return false;
        };
        if !self.identical_gep_accesses_in_same_loop(gep1, gep2) {
            return false;
        }
        !self.can_precede_in_current_iteration(src, dst)
    }

    fn is_backedge_into_same_global(&self, src: ValueId, dst: ValueId) -> bool {
        let Some((array1, gep1)) = self.primitive_array_access(src, true) else {
            return false;
        };
        let Some((array2, gep2)) = self.primitive_array_access(dst, true) else {
            return false;
        };
        if array1 != array2 || !self.primitive_array_globals.contains(&array1) {
            return false;
        }

        let src_kind = self.module.inst(src).map(|i| &i.kind);
        let dst_kind = self.module.inst(dst).map(|i| &i.kind);
        let matches_shape = match (gep1, gep2) {
            // Two loads through the same IV-governed element pointer.
            (Some(g1), Some(g2)) => {
                self.identical_gep_accesses_in_same_loop(g1, g2)
                    && matches!(src_kind, Some(InstKind::Load { .. }))
                    && matches!(dst_kind, Some(InstKind::Load { .. }))
            }
            // A store into an element against a whole-array load (or the
            // mirror image).
            (Some(_), None) => {
                matches!(src_kind, Some(InstKind::Store { .. }))
                    && matches!(dst_kind, Some(InstKind::Load { .. }))
            }
            (None, Some(_)) => {
                matches!(src_kind, Some(InstKind::Load { .. }))
                    && matches!(dst_kind, Some(InstKind::Store { .. }))
            }
            (None, None) => false,
        };
        if !matches_shape {
            return false;
        }
        !self.can_precede_in_current_iteration(src, dst)
    }

    fn gep_indices_constant_or_iv(&self, gep: ValueId) -> bool {
        let Some(inst) = self.module.inst(gep) else {
            return false;
        };
        let Some(forest) = self.forests.get(&inst.function) else {
            return false;
        };
        ScalarEvolution::new(self.module, inst.function, forest).gep_indices_constant_or_iv(gep)
    }

    fn identical_gep_accesses_in_same_loop(&self, gep1: ValueId, gep2: ValueId) -> bool {
        if gep1 == gep2 {
            return true;
        }
        let (Some(i1), Some(i2)) = (self.module.inst(gep1), self.module.inst(gep2)) else {
            return false;
        };
        if i1.function != i2.function {
            return false;
        }
        let Some(forest) = self.forests.get(&i1.function) else {
            return false;
        };
        if forest.innermost_containing_inst(self.module, gep1)
            != forest.innermost_containing_inst(self.module, gep2)
        {
            return false;
        }
        let (InstKind::Gep { base: b1, indices: x1 }, InstKind::Gep { base: b2, indices: x2 }) =
            (&i1.kind, &i2.kind)
        else {
            return false;
        };
        let bases_match = b1 == b2 || {
            // Both bases loaded from the same pointer.
            match (
                self.module.inst(*b1).map(|i| &i.kind),
                self.module.inst(*b2).map(|i| &i.kind),
            ) {
                (Some(InstKind::Load { ptr: p1 }), Some(InstKind::Load { ptr: p2 })) => p1 == p2,
                _ => false,
            }
        };
        bases_match && x1 == x2
    }

    /// Whether `from` can execute before `to` within a single iteration of
    /// `from`'s innermost loop: a backwards walk from `to` that stops at
    /// the loop header either reaches `from`'s block or it does not.
    fn can_precede_in_current_iteration(&self, from: ValueId, to: ValueId) -> bool {
        let (Some(fi), Some(ti)) = (self.module.inst(from), self.module.inst(to)) else {
            return false;
        };
        if fi.function != ti.function {
            return false;
        }
        let function = fi.function;
        if fi.block == ti.block {
            return self.module.precedes_in_block(from, to);
        }
        let header = self.forests.get(&function).and_then(|forest| {
            forest
                .innermost_containing_inst(self.module, from)
                .map(|l| forest.get(l).header)
        });

        let mut reached: BTreeSet<crate::ir::BlockId> = BTreeSet::new();
        let mut worklist = VecDeque::new();
        reached.insert(ti.block);
        worklist.push_back(ti.block);
        while let Some(b) = worklist.pop_front() {
            if b == fi.block {
                return true;
            }
            if Some(b) == header {
                continue;
            }
            for pred in self.module.predecessors(function, b) {
                if reached.insert(pred) {
                    worklist.push_back(pred);
                }
            }
        }
        false
    }

    // ---- class 2: non-memory-writing functions ----------------------------

    fn edge_is_along_non_memory_writing_functions(&self, pdg: &Pdg, edge: EdgeId) -> bool {
        let kind = pdg.edge_kind(edge).expect("live edge");
        if !kind.is_memory() {
            return false;
        }
        let (src, dst) = pdg.edge_payloads(edge).expect("live edge");
        let src_call = self.call_target(src);
        let dst_call = self.call_target(dst);

        match (src_call, dst_call) {
            (Some(a), Some(b)) => self.is_non_writing(&a) && self.is_non_writing(&b),
            (Some(call), None) => self.mem_side_allows_drop(&call, dst),
            (None, Some(call)) => self.mem_side_allows_drop(&call, src),
            (None, None) => false,
        }
    }

    fn call_target(&self, v: ValueId) -> Option<Callee> {
        match self.module.inst(v).map(|i| &i.kind) {
            Some(InstKind::Call { callee, .. }) => Some(callee.clone()),
            _ => None,
        }
    }

    fn is_memoryless(&self, callee: &Callee) -> bool {
        match callee {
            Callee::Direct(f) => self.memoryless.contains(f),
            Callee::External(name) => classify_external(name) == ExternalKind::Memoryless,
            Callee::Indirect(_) => false,
        }
    }

    fn is_non_writing(&self, callee: &Callee) -> bool {
        self.is_memoryless(callee)
            || matches!(callee, Callee::External(name)
                if classify_external(name) == ExternalKind::ReadOnly)
    }

    fn mem_side_allows_drop(&self, call: &Callee, mem: ValueId) -> bool {
        match self.module.inst(mem).map(|i| &i.kind) {
            Some(InstKind::Load { .. }) => self.is_non_writing(call),
            Some(InstKind::Store { .. }) => self.is_memoryless(call),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::alias::ConservativeAliasOracle;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::{CmpPred, Type};
    use crate::pdg::{PdgBuilder, PdgOptions};

    /// A loop writing then reading a[i] with an IV-governed GEP:
    /// the cross-iteration store/load edges are removable.
    fn iv_array_loop() -> (Module, ValueId, ValueId) {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 1, Type::Void);
        let n = mb.param(f, 0);
        let b0 = mb.block(f);
        let b1 = mb.block(f);
        let b2 = mb.block(f);
        let b3 = mb.block(f);

        let arr = mb.alloca(f, b0, Type::Array { size: 64 });
        mb.br(f, b0, b1);
        let zero = mb.const_int(0);
        let one = mb.const_int(1);
        let i = mb.phi(f, b1, Type::Int);
        let c = mb.cmp(f, b1, CmpPred::Eq, i, n);
        mb.cond_br(f, b1, c, b3, b2);
        let gep = mb.gep(f, b2, arr, vec![i]);
        let store = mb.store(f, b2, i, gep);
        let load = mb.load(f, b2, gep);
        let next = mb.add(f, b2, i, one);
        mb.br(f, b2, b1);
        mb.ret(f, b3, None);
        mb.add_phi_incoming(i, zero, b0);
        mb.add_phi_incoming(i, next, b2);
        (mb.finish(), store, load)
    }

    #[test]
    fn test_same_offset_backedge_is_removed() {
        let (m, store, load) = iv_array_loop();
        let cg = CallGraph::new(&m);
        let mut pdg =
            PdgBuilder::from_module(&m, &ConservativeAliasOracle, &PdgOptions::default()).unwrap();

        let ns = pdg.fetch_node(store).unwrap();
        let nl = pdg.fetch_node(load).unwrap();
        let memory_edges_before = pdg
            .edges_between(ns, nl)
            .iter()
            .filter(|e| pdg.edge_kind(**e).unwrap().is_memory())
            .count();
        assert!(memory_edges_before > 0);

        let removed =
            remove_edges_not_used_by_parallel_schemes(&mut pdg, &m, &cg, &RefineOptions::parallelizer());
        assert!(removed > 0);

        // The intra-iteration orientation may stay; the backedge (load ->
        // store across iterations) must be gone.
        let war_left = pdg
            .edges_between(ns, nl)
            .iter()
            .filter(|e| {
                let k = pdg.edge_kind(**e).unwrap();
                k.is_memory() && k.is_war()
            })
            .count();
        assert_eq!(war_left, 0);
    }

    #[test]
    fn test_disabled_options_remove_nothing() {
        let (m, _, _) = iv_array_loop();
        let cg = CallGraph::new(&m);
        let mut pdg =
            PdgBuilder::from_module(&m, &ConservativeAliasOracle, &PdgOptions::default()).unwrap();
        let removed =
            remove_edges_not_used_by_parallel_schemes(&mut pdg, &m, &cg, &RefineOptions::default());
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_memoryless_callee_edges_are_removed() {
        let mut mb = ModuleBuilder::new("m");
        // A pure function: integer arithmetic only.
        let pure = mb.function("halve", 1, Type::Int);
        let bp = mb.block(pure);
        let two = mb.const_int(2);
        let half = mb.binary(pure, bp, crate::ir::BinaryOp::Div, mb.param(pure, 0), two);
        mb.ret(pure, bp, Some(half));

        let f = mb.function("main", 0, Type::Void);
        let b0 = mb.block(f);
        let p = mb.alloca(f, b0, Type::Int);
        let c = mb.const_int(8);
        let store = mb.store(f, b0, c, p);
        let call = mb.call_direct(f, b0, pure, vec![c]);
        mb.ret(f, b0, None);
        let m = mb.finish();
        let cg = CallGraph::new(&m);

        // The conservative oracle pessimistically orders the call with the
        // store; the memoryless refinement undoes that.
        let mut pdg =
            PdgBuilder::from_module(&m, &ConservativeAliasOracle, &PdgOptions::default()).unwrap();
        let ns = pdg.fetch_node(store).unwrap();
        let ncall = pdg.fetch_node(call).unwrap();
        // Force a pessimistic edge pair for the test regardless of oracle
        // precision.
        if pdg
            .edges_between(ns, ncall)
            .iter()
            .all(|e| !pdg.edge_kind(*e).unwrap().is_memory())
        {
            let e = pdg.add_edge(store, call).unwrap();
            pdg.set_data_dependence(e, crate::graph::DataKind::Waw, true, false)
                .unwrap();
        }

        let removed =
            remove_edges_not_used_by_parallel_schemes(&mut pdg, &m, &cg, &RefineOptions::parallelizer());
        assert!(removed > 0);
        assert!(pdg
            .edges_between(ns, ncall)
            .iter()
            .all(|e| !pdg.edge_kind(*e).unwrap().is_memory()));
    }
}
