//! Canned dataflow analyses
//!
//! The two engine instantiations downstream consumers reach for:
//! reachability (which instructions may execute after a given one, used
//! when packing stage instructions within blocks) and liveness.

use super::{DataFlowEngine, DataFlowResult};
use crate::error::Result;
use crate::ir::{FunctionId, Module, Value, ValueId};

/// Backward reachability: after the fixed point, `OUT(i)` holds every
/// instruction that may execute after `i`, and `IN(i)` additionally holds
/// `i` itself.
pub fn reachable_instructions(
    engine: &DataFlowEngine,
    module: &Module,
    function: FunctionId,
) -> Result<DataFlowResult> {
    engine.apply_backward(
        module,
        function,
        |_, inst, df| {
            df.gen_mut(inst).insert(inst);
        },
        |_, _, _| {},
        |df, inst, succ| df.union_in_into_out(succ, inst),
        |df, inst| df.transfer_backward(inst),
    )
}

/// Classic liveness: `IN(i)` holds the values live into `i`. A value is
/// generated by a use and killed by its definition.
pub fn live_values(
    engine: &DataFlowEngine,
    module: &Module,
    function: FunctionId,
) -> Result<DataFlowResult> {
    engine.apply_backward(
        module,
        function,
        |module, inst, df| {
            let operands = module.inst(inst).map(|i| i.operands()).unwrap_or_default();
            for op in operands {
                if matches!(module.value(op), Value::Inst(_) | Value::Argument { .. }) {
                    df.gen_mut(inst).insert(op);
                }
            }
        },
        |_, inst, df| {
            df.kill_mut(inst).insert(inst);
        },
        |df, inst, succ| df.union_in_into_out(succ, inst),
        |df, inst| df.transfer_backward(inst),
    )
}

/// Values live out of the whole function body: the union of OUT over its
/// return instructions.
pub fn live_out_of(df: &DataFlowResult, module: &Module, function: FunctionId) -> Vec<ValueId> {
    let mut out: Vec<ValueId> = module
        .exit_blocks(function)
        .into_iter()
        .filter_map(|b| module.terminator_of(function, b))
        .flat_map(|t| df.out_of(t).iter().copied().collect::<Vec<_>>())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::{CmpPred, Type};

    fn loop_function() -> (Module, FunctionId, Vec<ValueId>) {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 1, Type::Void);
        let b0 = mb.block(f);
        let b1 = mb.block(f);
        let b2 = mb.block(f);
        let b3 = mb.block(f);
        mb.br(f, b0, b1);
        let zero = mb.const_int(0);
        let one = mb.const_int(1);
        let i = mb.phi(f, b1, Type::Int);
        let c = mb.cmp(f, b1, CmpPred::Eq, i, mb.param(f, 0));
        mb.cond_br(f, b1, c, b3, b2);
        let next = mb.add(f, b2, i, one);
        mb.br(f, b2, b1);
        mb.ret(f, b3, None);
        mb.add_phi_incoming(i, zero, b0);
        mb.add_phi_incoming(i, next, b2);
        let m = mb.finish();
        let insts = m.instructions_of(f);
        (m, f, insts)
    }

    #[test]
    fn test_reachability_crosses_the_backedge() {
        let (m, f, insts) = loop_function();
        let engine = DataFlowEngine::new();
        let df = reachable_instructions(&engine, &m, f).unwrap();

        let first = insts[0];
        let last = *insts.last().unwrap();
        // The return is reachable from the entry branch.
        assert!(df.out_of(first).contains(&last));
        // Loop instructions reach themselves around the backedge.
        let phi = insts[1];
        assert!(df.out_of(phi).contains(&phi));
        // Nothing executes after the return.
        assert!(df.out_of(last).is_empty());
    }

    #[test]
    fn test_liveness_of_loop_counter() {
        let (m, f, insts) = loop_function();
        let engine = DataFlowEngine::new();
        let df = live_values(&engine, &m, f).unwrap();

        let phi = insts[1];
        let cmp = insts[2];
        let next = insts[4];
        let latch_br = insts[5];
        // The counter is live into its comparison.
        assert!(df.in_of(cmp).contains(&phi));
        // The increment feeds the phi around the backedge, so it is live
        // through the latch branch.
        assert!(df.in_of(latch_br).contains(&next));
        // The counter dies at its increment.
        assert!(!df.in_of(latch_br).contains(&phi));
        // Nothing is live after the function returns.
        let ret = *insts.last().unwrap();
        assert!(df.out_of(ret).is_empty());
    }
}
