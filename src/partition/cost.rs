//! Invocation-latency cost model
//!
//! Deterministic, memoized estimates used by the merging heuristics:
//! an instruction's latency, an SCC's latency (sum over members), and a
//! stage's latency: the most expensive member SCC plus a fixed charge per
//! queue value, a value some member SCC consumes or produces across its
//! boundary.

use crate::ir::{Callee, InstKind, Module, ValueId};
use crate::scc::{SccDag, SccId};
use std::collections::{BTreeSet, HashMap};

/// Fixed latency charged per queue value of a stage.
const QUEUE_LATENCY: u64 = 100;

/// Latency of an unknown callee.
const UNKNOWN_CALLEE_LATENCY: u64 = 50;

/// Memoized latency oracle.
#[derive(Default)]
pub struct InvocationLatency {
    scc_cost: HashMap<SccId, u64>,
    scc_externals: HashMap<SccId, BTreeSet<ValueId>>,
    callee_cost: HashMap<crate::ir::FunctionId, u64>,
}

impl InvocationLatency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency of one instruction. PHI/GEP/cast cost nothing; loads and
    /// stores dominate; terminators sit in between; calls add their
    /// callee's body size (not recursively) or a flat charge when the
    /// callee is unknown.
    pub fn instruction_latency(&mut self, module: &Module, value: ValueId) -> u64 {
        let Some(inst) = module.inst(value) else {
            return 0;
        };
        if inst.is_syntactic_sugar() {
            return 0;
        }

        let mut latency = match inst.kind {
            InstKind::Load { .. } | InstKind::Store { .. } => 10,
            _ if inst.is_terminator() => 5,
            _ => 1,
        };

        if let InstKind::Call { callee, .. } = &inst.kind {
            latency += match callee {
                Callee::Direct(f) if !module.function(*f).is_empty() => {
                    if let Some(cost) = self.callee_cost.get(f) {
                        *cost
                    } else {
                        let cost = module
                            .instructions_of(*f)
                            .iter()
                            .filter(|v| {
                                module
                                    .inst(**v)
                                    .is_some_and(|i| !i.is_syntactic_sugar())
                            })
                            .count() as u64;
                        self.callee_cost.insert(*f, cost);
                        cost
                    }
                }
                _ => UNKNOWN_CALLEE_LATENCY,
            };
        }

        latency
    }

    /// Latency of an SCC: the sum over its member instructions.
    pub fn scc_latency(&mut self, module: &Module, dag: &SccDag, scc: SccId) -> u64 {
        if let Some(cost) = self.scc_cost.get(&scc) {
            return *cost;
        }
        let cost = dag
            .scc(scc)
            .internal_values()
            .into_iter()
            .map(|v| self.instruction_latency(module, v))
            .sum();
        self.scc_cost.insert(scc, cost);
        cost
    }

    /// Live-in/out values of an SCC, memoized.
    fn scc_externals(&mut self, dag: &SccDag, scc: SccId) -> &BTreeSet<ValueId> {
        self.scc_externals
            .entry(scc)
            .or_insert_with(|| dag.scc(scc).external_values().into_iter().collect())
    }

    /// Latency of running a set of SCC groups as one stage: the costliest
    /// member SCC plus the queue charge for every distinct external value.
    pub fn stage_latency(
        &mut self,
        module: &Module,
        dag: &SccDag,
        groups: &[&BTreeSet<SccId>],
    ) -> u64 {
        let mut max_internal = 0u64;
        let mut queue_values: BTreeSet<ValueId> = BTreeSet::new();
        for group in groups {
            for scc in group.iter() {
                let internal = self.scc_latency(module, dag, *scc);
                max_internal = max_internal.max(internal);
                queue_values.extend(self.scc_externals(dag, *scc).iter().copied());
            }
        }
        let mut cost = max_internal;
        for v in &queue_values {
            cost += self.queue_latency(*v);
        }
        cost
    }

    /// Flat per-value queue charge.
    pub fn queue_latency(&self, _value: ValueId) -> u64 {
        QUEUE_LATENCY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::alias::BaseObjectAliasOracle;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::Type;
    use crate::pdg::{PdgBuilder, PdgOptions};

    #[test]
    fn test_instruction_latencies() {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 0, Type::Void);
        let b0 = mb.block(f);
        let p = mb.alloca(f, b0, Type::Array { size: 4 });
        let zero = mb.const_int(0);
        let gep = mb.gep(f, b0, p, vec![zero]);
        let load = mb.load(f, b0, gep);
        let add = mb.add(f, b0, load, zero);
        let ret = mb.ret(f, b0, Some(add));
        let m = mb.finish();

        let mut il = InvocationLatency::new();
        assert_eq!(il.instruction_latency(&m, gep), 0);
        assert_eq!(il.instruction_latency(&m, load), 10);
        assert_eq!(il.instruction_latency(&m, add), 1);
        assert_eq!(il.instruction_latency(&m, ret), 5);
        assert_eq!(il.instruction_latency(&m, p), 1);
    }

    #[test]
    fn test_known_callee_adds_body_size() {
        let mut mb = ModuleBuilder::new("m");
        let callee = mb.function("callee", 0, Type::Int);
        let bc = mb.block(callee);
        let one = mb.const_int(1);
        let x = mb.add(callee, bc, one, one);
        mb.ret(callee, bc, Some(x));

        let f = mb.function("main", 0, Type::Void);
        let b0 = mb.block(f);
        let known = mb.call_direct(f, b0, callee, vec![]);
        let unknown = mb.call_external(f, b0, "mystery", vec![], Type::Int);
        mb.ret(f, b0, None);
        let m = mb.finish();

        let mut il = InvocationLatency::new();
        // 1 (call) + 2 non-sugar callee instructions.
        assert_eq!(il.instruction_latency(&m, known), 3);
        // 1 (call) + 50 for the unknown callee.
        assert_eq!(il.instruction_latency(&m, unknown), 51);
    }

    #[test]
    fn test_stage_latency_is_max_plus_queues() {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 0, Type::Void);
        let b0 = mb.block(f);
        let p = mb.alloca(f, b0, Type::Int);
        let c = mb.const_int(3);
        mb.store(f, b0, c, p);
        let l = mb.load(f, b0, p);
        mb.ret(f, b0, Some(l));
        let m = mb.finish();

        let pdg = PdgBuilder::from_module(&m, &BaseObjectAliasOracle, &PdgOptions::default())
            .unwrap();
        let dag = SccDag::from_pdg(&pdg).unwrap();
        let mut il = InvocationLatency::new();

        let sccs: BTreeSet<SccId> = dag.internal_sccs().into_iter().collect();
        let max_scc = sccs
            .iter()
            .map(|s| il.scc_latency(&m, &dag, *s))
            .max()
            .unwrap();
        let stage = il.stage_latency(&m, &dag, &[&sccs]);
        assert!(stage >= max_scc);
        // The queue charge is a multiple of the flat latency.
        assert_eq!((stage - max_scc) % 100, 0);
    }
}
