//! The forward/backward worklist solver
//!
//! Blocks are the worklist unit. Processing a block meets the incoming
//! state into its boundary instruction and recomputes that instruction's
//! state; when the boundary state changed or the block is new, it sweeps
//! the rest of the block once and enqueues the affected neighbor blocks. Hooks are owned closures; the engine imposes no lattice, so
//! termination is the hooks' contract (monotone over a finite lattice),
//! backstopped by a per-block visit ceiling that turns runaway iteration
//! into a fatal error instead of a hang.

use super::DataFlowResult;
use crate::error::{Result, WeftError};
use crate::ir::{BlockId, FunctionId, Module, ValueId};
use std::collections::{HashSet, VecDeque};

/// Reusable engine configuration.
pub struct DataFlowEngine {
    max_block_visits: Option<usize>,
}

impl Default for DataFlowEngine {
    fn default() -> Self {
        DataFlowEngine {
            max_block_visits: None,
        }
    }
}

impl DataFlowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of times any single block may be processed.
    /// Exceeding the cap is an invariant violation, not a truncation.
    pub fn with_max_block_visits(max: usize) -> Self {
        DataFlowEngine {
            max_block_visits: Some(max),
        }
    }

    fn visit_ceiling(&self, block_count: usize) -> usize {
        self.max_block_visits
            .unwrap_or_else(|| 10 * block_count.max(1) + 64)
    }

    /// Forward analysis over `function`.
    ///
    /// - `compute_gen` / `compute_kill` run once per instruction;
    /// - `init_in` / `init_out` seed the per-instruction sets;
    /// - `meet_in(df, inst, pred)` merges a predecessor instruction's
    ///   state into IN(inst);
    /// - `step_out(df, inst)` recomputes OUT(inst) from IN(inst).
    pub fn apply_forward(
        &self,
        module: &Module,
        function: FunctionId,
        compute_gen: impl Fn(&Module, ValueId, &mut DataFlowResult),
        compute_kill: impl Fn(&Module, ValueId, &mut DataFlowResult),
        init_in: impl Fn(ValueId, &mut HashSet<ValueId>),
        init_out: impl Fn(ValueId, &mut HashSet<ValueId>),
        meet_in: impl Fn(&mut DataFlowResult, ValueId, ValueId),
        step_out: impl Fn(&mut DataFlowResult, ValueId),
    ) -> Result<DataFlowResult> {
        let f = module.function(function);
        let mut df = DataFlowResult::new();

        for inst in module.instructions_of(function) {
            init_in(inst, df.in_mut(inst));
            init_out(inst, df.out_mut(inst));
        }
        for inst in module.instructions_of(function) {
            compute_gen(module, inst, &mut df);
            compute_kill(module, inst, &mut df);
        }

        let mut worklist: VecDeque<BlockId> = f.block_ids().collect();
        let mut queued: HashSet<BlockId> = worklist.iter().copied().collect();
        let mut visited_boundary: HashSet<ValueId> = HashSet::new();
        let mut visits = vec![0usize; f.blocks.len()];
        let ceiling = self.visit_ceiling(f.blocks.len());

        while let Some(block) = worklist.pop_front() {
            queued.remove(&block);
            let insts = &f.block(block).insts;
            let Some(first) = insts.first().copied() else {
                continue;
            };
            visits[block.0 as usize] += 1;
            if visits[block.0 as usize] > ceiling {
                return Err(WeftError::invariant(
                    "DataFlowEngine::apply_forward",
                    format!("block {block:?} visited more than {ceiling} times; non-monotone hooks?"),
                ));
            }

            for pred in module.predecessors(function, block) {
                if let Some(last) = f.block(pred).insts.last().copied() {
                    meet_in(&mut df, first, last);
                }
            }

            let old_size = df.out_of(first).len();
            step_out(&mut df, first);

            if !visited_boundary.contains(&first) || df.out_of(first).len() != old_size {
                visited_boundary.insert(first);

                let mut pred_inst = first;
                for inst in insts.iter().skip(1).copied() {
                    meet_in(&mut df, inst, pred_inst);
                    step_out(&mut df, inst);
                    pred_inst = inst;
                }

                for succ in module.successors(function, block) {
                    if queued.insert(succ) {
                        worklist.push_back(succ);
                    }
                }
            }
        }
        Ok(df)
    }

    /// Backward analysis: successors feed OUT, the step recomputes IN,
    /// and a changed block boundary re-enqueues the predecessors.
    ///
    /// - `meet_out(df, inst, succ)` merges a successor instruction's
    ///   state into OUT(inst);
    /// - `step_in(df, inst)` recomputes IN(inst) from OUT(inst).
    pub fn apply_backward(
        &self,
        module: &Module,
        function: FunctionId,
        compute_gen: impl Fn(&Module, ValueId, &mut DataFlowResult),
        compute_kill: impl Fn(&Module, ValueId, &mut DataFlowResult),
        meet_out: impl Fn(&mut DataFlowResult, ValueId, ValueId),
        step_in: impl Fn(&mut DataFlowResult, ValueId),
    ) -> Result<DataFlowResult> {
        let f = module.function(function);
        let mut df = DataFlowResult::new();

        for inst in module.instructions_of(function) {
            compute_gen(module, inst, &mut df);
            compute_kill(module, inst, &mut df);
        }

        // Seed in reverse function order so later blocks drain first.
        let mut worklist: VecDeque<BlockId> = VecDeque::new();
        for b in f.block_ids() {
            worklist.push_front(b);
        }
        let mut queued: HashSet<BlockId> = worklist.iter().copied().collect();
        let mut visited_boundary: HashSet<ValueId> = HashSet::new();
        let mut visits = vec![0usize; f.blocks.len()];
        let ceiling = self.visit_ceiling(f.blocks.len());

        while let Some(block) = worklist.pop_front() {
            queued.remove(&block);
            let insts = &f.block(block).insts;
            let Some(last) = insts.last().copied() else {
                continue;
            };
            visits[block.0 as usize] += 1;
            if visits[block.0 as usize] > ceiling {
                return Err(WeftError::invariant(
                    "DataFlowEngine::apply_backward",
                    format!("block {block:?} visited more than {ceiling} times; non-monotone hooks?"),
                ));
            }

            for succ in module.successors(function, block) {
                if let Some(first) = f.block(succ).insts.first().copied() {
                    meet_out(&mut df, last, first);
                }
            }

            let old_size = df.in_of(last).len();
            step_in(&mut df, last);

            if !visited_boundary.contains(&last) || df.in_of(last).len() != old_size {
                visited_boundary.insert(last);

                let mut succ_inst = last;
                for inst in insts.iter().rev().skip(1).copied() {
                    meet_out(&mut df, inst, succ_inst);
                    step_in(&mut df, inst);
                    succ_inst = inst;
                }

                for pred in module.predecessors(function, block) {
                    if queued.insert(pred) {
                        worklist.push_back(pred);
                    }
                }
            }
        }
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::{CmpPred, InstKind, Type};

    /// Reaching definitions on a diamond: x defined in the entry,
    /// redefined on the left branch, used at the merge.
    #[test]
    fn test_reaching_definitions_diamond() {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 1, Type::Void);
        let b0 = mb.block(f);
        let b1 = mb.block(f);
        let b2 = mb.block(f);
        let b3 = mb.block(f);
        let p = mb.alloca(f, b0, Type::Int);
        let zero = mb.const_int(0);
        let one = mb.const_int(1);
        let def_a = mb.store(f, b0, zero, p);
        let c = mb.cmp(f, b0, CmpPred::Eq, mb.param(f, 0), zero);
        mb.cond_br(f, b0, c, b1, b2);
        let def_b = mb.store(f, b1, one, p);
        mb.br(f, b1, b3);
        mb.br(f, b2, b3);
        let use_x = mb.load(f, b3, p);
        mb.ret(f, b3, Some(use_x));
        let m = mb.finish();

        // GEN = {the store}; KILL = {all other stores to the same slot}.
        let stores = [def_a, def_b];
        let engine = DataFlowEngine::new();
        let df = engine
            .apply_forward(
                &m,
                f,
                |module, inst, df| {
                    if matches!(module.inst(inst).unwrap().kind, InstKind::Store { .. }) {
                        df.gen_mut(inst).insert(inst);
                    }
                },
                |module, inst, df| {
                    if matches!(module.inst(inst).unwrap().kind, InstKind::Store { .. }) {
                        for other in stores {
                            if other != inst {
                                df.kill_mut(inst).insert(other);
                            }
                        }
                    }
                },
                |_, _| {},
                |_, _| {},
                |df, inst, pred| df.union_out_into_in(pred, inst),
                |df, inst| df.transfer_forward(inst),
            )
            .unwrap();

        let reaching = df.in_of(use_x);
        assert!(reaching.contains(&def_a), "def from the right path reaches");
        assert!(reaching.contains(&def_b), "def from the left path reaches");
        let out = df.out_of(use_x);
        assert!(out.contains(&def_a) && out.contains(&def_b));
        // Inside the left branch the entry definition is killed.
        assert!(!df.out_of(def_b).contains(&def_a));
    }

    /// Identity MEET and empty GEN/KILL must settle in one sweep per
    /// block.
    #[test]
    fn test_identity_hooks_terminate_quickly() {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 1, Type::Void);
        let b0 = mb.block(f);
        let b1 = mb.block(f);
        let b2 = mb.block(f);
        mb.br(f, b0, b1);
        let zero = mb.const_int(0);
        let c = mb.cmp(f, b1, CmpPred::Eq, mb.param(f, 0), zero);
        mb.cond_br(f, b1, c, b2, b1);
        mb.ret(f, b2, None);
        let m = mb.finish();

        // A ceiling of 2 allows the initial sweep plus one re-visit; with
        // identity hooks no block should need more.
        let engine = DataFlowEngine::with_max_block_visits(2);
        let df = engine
            .apply_forward(
                &m,
                f,
                |_, _, _| {},
                |_, _, _| {},
                |_, _| {},
                |_, _| {},
                |_, _, _| {},
                |_, _| {},
            )
            .unwrap();
        for inst in m.instructions_of(f) {
            assert!(df.in_of(inst).is_empty());
            assert!(df.out_of(inst).is_empty());
        }
    }

    /// A hook that grows OUT forever must hit the ceiling, not hang.
    #[test]
    fn test_non_monotone_hooks_hit_the_ceiling() {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 1, Type::Void);
        let b0 = mb.block(f);
        let b1 = mb.block(f);
        let b2 = mb.block(f);
        mb.br(f, b0, b1);
        let zero = mb.const_int(0);
        let c = mb.cmp(f, b1, CmpPred::Eq, mb.param(f, 0), zero);
        mb.cond_br(f, b1, c, b2, b1);
        mb.ret(f, b2, None);
        let m = mb.finish();

        let counter = std::cell::Cell::new(0u32);
        let engine = DataFlowEngine::with_max_block_visits(5);
        let result = engine.apply_forward(
            &m,
            f,
            |_, _, _| {},
            |_, _, _| {},
            |_, _| {},
            |_, _| {},
            |_, _, _| {},
            |df, inst| {
                // Invent a fresh value every step: never reaches a fixed
                // point.
                counter.set(counter.get() + 1);
                df.out_mut(inst).insert(ValueId(1_000_000 + counter.get()));
            },
        );
        assert!(matches!(
            result,
            Err(WeftError::InvariantViolation { .. })
        ));
    }
}
