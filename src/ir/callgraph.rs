//! Program call graph
//!
//! Direct call sites only; indirect and external calls have no callee node
//! here and are handled conservatively by their consumers. Reachability
//! from the entry function mirrors the "call graph under main" set the
//! dependence refinements scope themselves to.

use super::{Callee, FunctionId, InstKind, Module, Value, ValueId};
use std::collections::{BTreeSet, VecDeque};

/// Module-level call graph.
pub struct CallGraph {
    /// Per caller: (call instruction, callee) pairs in program order.
    call_sites: Vec<Vec<(ValueId, FunctionId)>>,
}

impl CallGraph {
    pub fn new(module: &Module) -> Self {
        let mut call_sites: Vec<Vec<(ValueId, FunctionId)>> =
            vec![Vec::new(); module.functions.len()];
        for (idx, value) in module.values.iter().enumerate() {
            let Value::Inst(inst) = value else { continue };
            let InstKind::Call {
                callee: Callee::Direct(callee),
                ..
            } = &inst.kind
            else {
                continue;
            };
            call_sites[inst.function.0 as usize].push((ValueId(idx as u32), *callee));
        }
        CallGraph { call_sites }
    }

    /// Call sites inside `caller`, in program order.
    pub fn call_sites_in(&self, caller: FunctionId) -> &[(ValueId, FunctionId)] {
        &self.call_sites[caller.0 as usize]
    }

    /// Functions with a body reachable from `entry` through direct calls,
    /// `entry` included.
    pub fn functions_reachable_from(&self, module: &Module, entry: FunctionId) -> BTreeSet<FunctionId> {
        let mut reached = BTreeSet::new();
        let mut worklist = VecDeque::new();
        reached.insert(entry);
        worklist.push_back(entry);
        while let Some(f) = worklist.pop_front() {
            for (_, callee) in self.call_sites_in(f) {
                if module.function(*callee).is_empty() {
                    continue;
                }
                if reached.insert(*callee) {
                    worklist.push_back(*callee);
                }
            }
        }
        reached
    }

    /// Every call instruction whose callee is in `called`, across the whole
    /// program.
    pub fn calls_to(&self, called: &BTreeSet<FunctionId>) -> Vec<ValueId> {
        let mut out = Vec::new();
        for sites in &self.call_sites {
            for (site, callee) in sites {
                if called.contains(callee) {
                    out.push(*site);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::Type;

    #[test]
    fn test_reachability_skips_unreferenced_functions() {
        let mut mb = ModuleBuilder::new("m");
        let leaf = mb.function("leaf", 0, Type::Int);
        let bl = mb.block(leaf);
        let one = mb.const_int(1);
        mb.ret(leaf, bl, Some(one));

        let orphan = mb.function("orphan", 0, Type::Void);
        let bo = mb.block(orphan);
        mb.ret(orphan, bo, None);

        let main = mb.function("main", 0, Type::Void);
        let bm = mb.block(main);
        mb.call_direct(main, bm, leaf, vec![]);
        mb.ret(main, bm, None);
        let m = mb.finish();

        let cg = CallGraph::new(&m);
        let reached = cg.functions_reachable_from(&m, main);
        assert!(reached.contains(&main));
        assert!(reached.contains(&leaf));
        assert!(!reached.contains(&orphan));
    }

    #[test]
    fn test_calls_to_collects_sites() {
        let mut mb = ModuleBuilder::new("m");
        let callee = mb.function("callee", 0, Type::Void);
        let bc = mb.block(callee);
        mb.ret(callee, bc, None);
        let main = mb.function("main", 0, Type::Void);
        let bm = mb.block(main);
        let site_a = mb.call_direct(main, bm, callee, vec![]);
        let site_b = mb.call_direct(main, bm, callee, vec![]);
        mb.ret(main, bm, None);
        let m = mb.finish();

        let cg = CallGraph::new(&m);
        let targets: BTreeSet<FunctionId> = [callee].into_iter().collect();
        assert_eq!(cg.calls_to(&targets), vec![site_a, site_b]);
    }
}
