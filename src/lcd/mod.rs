//! Loop-carried dependence classification
//!
//! Given a loop, a dominator summary, and the PDG over the loop's
//! instructions, mark each edge whose producer on one iteration
//! constrains its consumer on a later iteration. A first pass derives the
//! flag from dominance and reachability; a second pass clears flags on
//! RAW memory edges whose target array is provably overwritten in full by
//! a sub-loop before the consumer can read it.

use crate::diagnostics::Verbosity;
use crate::error::{Result, WeftError};
use crate::graph::EdgeId;
use crate::ir::dominators::DominatorSummary;
use crate::ir::loops::{LoopForest, LoopId};
use crate::ir::{BinaryOp, BlockId, InstKind, Module, Type, Value, ValueId};
use crate::pdg::Pdg;
use crate::pointsto::{ObjSource, PointToSummary};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info};

pub struct LoopCarriedDependences;

impl LoopCarriedDependences {
    /// Set the loop-carried flag on every qualifying edge of `pdg`, then
    /// clear the flags proven spurious by the overwriting recognizer.
    ///
    /// Without a point-to summary the recognizer cannot run; edges keep
    /// their conservative classification and a diagnostic says so.
    pub fn classify(
        module: &Module,
        forest: &LoopForest,
        top_loop: LoopId,
        doms: &DominatorSummary,
        pdg: &mut Pdg,
        point_to: Option<&PointToSummary>,
        verbosity: Verbosity,
    ) -> Result<()> {
        for edge in pdg.edges() {
            if pdg.is_loop_carried(edge)? {
                return Err(WeftError::invariant(
                    "LoopCarriedDependences::classify",
                    "loop-carried flag already set before classification",
                ));
            }
        }

        for edge in pdg.edges() {
            if is_loop_carried(module, forest, top_loop, doms, pdg, edge)? {
                pdg.set_loop_carried(edge, true)?;
            }
        }

        let Some(point_to) = point_to else {
            if verbosity >= Verbosity::Minimal {
                info!("no point-to summary: keeping conservative loop-carried flags");
            }
            return Ok(());
        };

        let mut spurious: Vec<EdgeId> = Vec::new();
        for edge in pdg.edges() {
            if removable_by_memory_overwriting(module, forest, top_loop, doms, pdg, edge, point_to)?
            {
                spurious.push(edge);
            }
        }
        for edge in spurious {
            if verbosity >= Verbosity::Minimal {
                let (src, dst) = pdg.edge_payloads(edge)?;
                debug!(%src, %dst, "removing spurious loop-carried edge");
            }
            pdg.set_loop_carried(edge, false)?;
        }
        Ok(())
    }

    /// Loop-carried edges whose consumer sits exactly in `loop_id`.
    pub fn loop_carried_edges_for_loop(
        module: &Module,
        forest: &LoopForest,
        loop_id: LoopId,
        pdg: &Pdg,
    ) -> Result<Vec<EdgeId>> {
        let mut out = Vec::new();
        for edge in pdg.edges() {
            if !pdg.is_loop_carried(edge)? {
                continue;
            }
            let (_, consumer) = pdg.edge_payloads(edge)?;
            if forest.innermost_containing_inst(module, consumer) == Some(loop_id) {
                out.push(edge);
            }
        }
        Ok(out)
    }
}

fn is_loop_carried(
    module: &Module,
    forest: &LoopForest,
    top_loop: LoopId,
    doms: &DominatorSummary,
    pdg: &Pdg,
    edge: EdgeId,
) -> Result<bool> {
    let top = forest.get(top_loop);
    let kind = pdg.edge_kind(edge)?;
    let (producer, consumer) = pdg.edge_payloads(edge)?;

    // Only dependences between instructions can be loop-carried.
    let (Some(producer_inst), Some(consumer_inst)) = (module.inst(producer), module.inst(consumer))
    else {
        return Ok(false);
    };

    // Both endpoints must live somewhere under the target loop.
    if !top.contains_inst(module, producer) || !top.contains_inst(module, consumer) {
        return Ok(false);
    }
    let producer_loop = forest.innermost_containing_inst(module, producer);
    let consumer_loop = forest.innermost_containing_inst(module, consumer);
    let (Some(producer_loop), Some(consumer_loop)) = (producer_loop, consumer_loop) else {
        return Ok(false);
    };

    // A control dependence fully inside a sub-loop is not carried by the
    // target loop.
    if kind.is_control() && producer_loop != top_loop && consumer_loop != top_loop {
        return Ok(false);
    }

    // For memory dependences, check whether both endpoints can only touch
    // the same element within one iteration.
    let mut same_element_each_iteration = true;
    if kind.is_memory() {
        let producer_ptr = producer_inst.pointer_operand();
        let consumer_ptr = consumer_inst.pointer_operand();
        match (producer_ptr, consumer_ptr) {
            (Some(p), Some(c)) if p == c => {
                // A pointer that is not an instruction, or one recomputed
                // inside the loop, may name a different element each
                // iteration.
                if module.inst(p).is_none() || top.contains_inst(module, p) {
                    same_element_each_iteration = false;
                }
            }
            _ => same_element_each_iteration = false,
        }
    }
    if !same_element_each_iteration {
        return Ok(true);
    }

    if producer == consumer || !doms.dominates_inst(module, producer, consumer) {
        // Register dependences allow two refinements.
        if kind.is_data() && !kind.is_memory() {
            let cannot_reach_header_first = !block_reaches_header_before_other(
                module,
                forest,
                consumer_loop,
                producer_inst.block,
                consumer_inst.block,
            );
            if cannot_reach_header_first {
                return Ok(false);
            }

            // Entering from the header, a dominating PHI consumer takes
            // its value from another incoming path, not from the previous
            // iteration's producer.
            let header_terminator = module
                .terminator_of(doms.function(), top.header)
                .ok_or_else(|| {
                    WeftError::invariant("LoopCarriedDependences", "loop header lacks terminator")
                })?;
            if doms.dominates_inst(module, consumer, producer)
                && doms.dominates_inst(module, header_terminator, consumer)
                && matches!(consumer_inst.kind, InstKind::Phi { .. })
            {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    Ok(false)
}

/// Whether execution leaving `from` can reach the loop header before
/// reaching `to`. Leaving the loop stops the walk; `from == to` means a
/// later iteration, which counts as reaching the header first.
fn block_reaches_header_before_other(
    module: &Module,
    forest: &LoopForest,
    loop_id: LoopId,
    from: BlockId,
    to: BlockId,
) -> bool {
    let l = forest.get(loop_id);
    if from == to {
        return true;
    }
    let exits: BTreeSet<BlockId> = l.exit_blocks.iter().copied().collect();
    let mut enqueued: BTreeSet<BlockId> = BTreeSet::new();
    let mut worklist: VecDeque<BlockId> = VecDeque::new();
    enqueued.insert(from);
    worklist.push_back(from);
    while let Some(b) = worklist.pop_front() {
        if b == l.header {
            return true;
        }
        if exits.contains(&b) || b == to {
            continue;
        }
        for succ in module.successors(forest.function, b) {
            if enqueued.insert(succ) {
                worklist.push_back(succ);
            }
        }
    }
    false
}

/// The overwriting recognizer: a loop-carried RAW memory dependence on an
/// array is spurious when some sub-loop rewrites the entire array each
/// iteration before the consumer reads it.
#[allow(clippy::too_many_arguments)]
fn removable_by_memory_overwriting(
    module: &Module,
    forest: &LoopForest,
    top_loop: LoopId,
    doms: &DominatorSummary,
    pdg: &Pdg,
    edge: EdgeId,
    point_to: &PointToSummary,
) -> Result<bool> {
    let kind = pdg.edge_kind(edge)?;
    if !(pdg.is_loop_carried(edge)? && kind.is_memory() && kind.is_raw()) {
        return Ok(false);
    }
    let (producer, consumer) = pdg.edge_payloads(edge)?;
    let (Some(producer_inst), Some(consumer_inst)) = (module.inst(producer), module.inst(consumer))
    else {
        return Ok(false);
    };
    if forest.innermost_containing_inst(module, producer).is_none()
        || forest.innermost_containing_inst(module, consumer).is_none()
    {
        return Ok(false);
    }

    // Both endpoints must access exactly one common memory object.
    let accessed = |inst: ValueId, i: &crate::ir::Instruction| {
        i.pointer_operand()
            .map(|p| point_to.pointees_at(module, inst, p))
            .unwrap_or_default()
    };
    let producer_objs = accessed(producer, producer_inst);
    let consumer_objs = accessed(consumer, consumer_inst);
    let must: BTreeSet<_> = producer_objs.intersection(&consumer_objs).copied().collect();
    let may: BTreeSet<_> = producer_objs.union(&consumer_objs).copied().collect();
    if !(must.len() == 1 && may.len() == 1) {
        return Ok(false);
    }
    let obj = *must.iter().next().unwrap();

    // Only stack arrays are recognized for now.
    let ObjSource::Alloca(alloca) = point_to.object_source(obj) else {
        return Ok(false);
    };
    let Some(InstKind::Alloca {
        allocated: Type::Array { size },
    }) = module.inst(alloca).map(|i| i.kind.clone())
    else {
        return Ok(false);
    };

    for child in &forest.get(top_loop).children.clone() {
        if subloop_fully_overwrites_array(
            module, forest, doms, pdg, *child, alloca, size, consumer,
        )? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The pattern: an induction variable running 0..size by 1, exactly one
/// store per iteration writing `gep(array, iv)` with a value free of
/// loop-carried dependences, and the sub-loop's header branch dominating
/// the consumer.
#[allow(clippy::too_many_arguments)]
fn subloop_fully_overwrites_array(
    module: &Module,
    forest: &LoopForest,
    doms: &DominatorSummary,
    pdg: &Pdg,
    subloop: LoopId,
    array: ValueId,
    array_size: u32,
    consumer: ValueId,
) -> Result<bool> {
    let sub = forest.get(subloop);
    let header_insts = &module.function(forest.function).block(sub.header).insts;

    // The index: the sub-loop's first header PHI, starting at 0 from
    // outside.
    let Some(array_index) = header_insts.iter().copied().find(|v| {
        matches!(module.inst(*v).map(|i| &i.kind), Some(InstKind::Phi { .. }))
    }) else {
        return Ok(false);
    };
    let Some(InstKind::Phi { incoming }) = module.inst(array_index).map(|i| i.kind.clone()) else {
        return Ok(false);
    };
    if incoming.len() != 2 {
        return Ok(false);
    }
    let mut starts_at_zero = false;
    let mut step_value = None;
    for (v, from) in &incoming {
        if sub.body.contains(from) {
            step_value = Some(*v);
        } else if let Value::ConstantInt(c) = module.value(*v) {
            starts_at_zero = *c == 0;
        }
    }
    if !starts_at_zero {
        return Ok(false);
    }

    // Stepped by one.
    let Some(step) = step_value else {
        return Ok(false);
    };
    let Some(InstKind::Binary {
        op: BinaryOp::Add,
        lhs,
        rhs,
    }) = module.inst(step).map(|i| i.kind.clone())
    else {
        return Ok(false);
    };
    let one_added = (lhs == array_index
        && matches!(module.value(rhs), Value::ConstantInt(1)))
        || (rhs == array_index && matches!(module.value(lhs), Value::ConstantInt(1)));
    if !one_added {
        return Ok(false);
    }

    // Ends at the array size: the header branches on iv == size.
    let Some(header_term) = module.terminator_of(forest.function, sub.header) else {
        return Ok(false);
    };
    let Some(InstKind::CondBranch { cond, .. }) =
        module.inst(header_term).map(|i| i.kind.clone())
    else {
        return Ok(false);
    };
    let Some(InstKind::Cmp {
        pred: crate::ir::CmpPred::Eq,
        lhs,
        rhs,
    }) = module.inst(cond).map(|i| i.kind.clone())
    else {
        return Ok(false);
    };
    let bound_is_size = lhs == array_index
        && matches!(module.value(rhs), Value::ConstantInt(c) if *c == i64::from(array_size));
    if !bound_is_size {
        return Ok(false);
    }

    // Exactly one store, writing gep(array, iv).
    let mut stores = Vec::new();
    for b in &sub.body {
        for v in &module.function(forest.function).block(*b).insts {
            if matches!(module.inst(*v).map(|i| &i.kind), Some(InstKind::Store { .. })) {
                stores.push(*v);
            }
        }
    }
    if stores.len() != 1 {
        return Ok(false);
    }
    let overwrite = stores[0];
    let Some(InstKind::Store { value, ptr }) = module.inst(overwrite).map(|i| i.kind.clone())
    else {
        return Ok(false);
    };
    let Some(InstKind::Gep { base, indices }) = module.inst(ptr).map(|i| i.kind.clone()) else {
        return Ok(false);
    };
    if base != array || indices != vec![array_index] {
        return Ok(false);
    }

    // The written data must itself be free of loop-carried dependences.
    for e in pdg.edges() {
        let (_, edge_consumer) = pdg.edge_payloads(e)?;
        if pdg.is_loop_carried(e)? && edge_consumer == value {
            return Ok(false);
        }
    }

    // The overwrite only helps if it surely runs before the read.
    Ok(doms.dominates_inst(module, header_term, consumer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::alias::BaseObjectAliasOracle;
    use crate::ir::builder::ModuleBuilder;
    use crate::ir::callgraph::CallGraph;
    use crate::ir::{CmpPred, FunctionId};
    use crate::pdg::{PdgBuilder, PdgOptions};
    use crate::pointsto::MayPointTo;

    fn classify_all(
        module: &Module,
        function: FunctionId,
        pdg: &mut Pdg,
        with_point_to: bool,
    ) -> (LoopForest, DominatorSummary) {
        let doms = DominatorSummary::new(module, function);
        let forest = LoopForest::new(module, function, &doms);
        let top = forest.roots()[0];
        let summary = if with_point_to {
            let cg = CallGraph::new(module);
            Some(MayPointTo::analyze(module, &cg).unwrap())
        } else {
            None
        };
        LoopCarriedDependences::classify(
            module,
            &forest,
            top,
            &doms,
            pdg,
            summary.as_ref(),
            Verbosity::Disabled,
        )
        .unwrap();
        (forest, doms)
    }

    /// Store then load through the same loop-invariant pointer inside a
    /// one-block loop: the forward RAW stays intra-iteration, the WAR back
    /// edge is carried.
    #[test]
    fn test_must_alias_store_load_in_loop() {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 1, Type::Void);
        let b0 = mb.block(f);
        let b1 = mb.block(f);
        let b2 = mb.block(f);
        let p = mb.alloca(f, b0, Type::Int);
        mb.br(f, b0, b1);
        let c7 = mb.const_int(7);
        let s = mb.store(f, b1, c7, p);
        let l = mb.load(f, b1, p);
        let zero = mb.const_int(0);
        let c = mb.cmp(f, b1, CmpPred::Eq, l, zero);
        mb.cond_br(f, b1, c, b2, b1);
        mb.ret(f, b2, None);
        let m = mb.finish();

        let mut pdg =
            PdgBuilder::from_module(&m, &BaseObjectAliasOracle, &PdgOptions::default()).unwrap();
        classify_all(&m, f, &mut pdg, false);

        let ns = pdg.fetch_node(s).unwrap();
        let nl = pdg.fetch_node(l).unwrap();
        for e in pdg.edges_between(ns, nl) {
            let kind = pdg.edge_kind(e).unwrap();
            if !kind.is_memory() {
                continue;
            }
            let (src, _) = pdg.edge_payloads(e).unwrap();
            if src == s {
                assert!(kind.is_raw());
                assert!(!pdg.is_loop_carried(e).unwrap(), "forward RAW is intra-iteration");
            } else {
                assert!(kind.is_war());
                assert!(pdg.is_loop_carried(e).unwrap(), "WAR back edge is carried");
            }
        }
    }

    /// The loop counter's increment feeding the header PHI is carried;
    /// the PHI feeding the increment is not.
    #[test]
    fn test_counter_recurrence() {
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

        let mut pdg =
            PdgBuilder::from_module(&m, &BaseObjectAliasOracle, &PdgOptions::default()).unwrap();
        classify_all(&m, f, &mut pdg, false);

        let nphi = pdg.fetch_node(i).unwrap();
        let nadd = pdg.fetch_node(next).unwrap();
        let forward = pdg.fetch_edge(nphi, nadd).expect("phi feeds add");
        assert!(!pdg.is_loop_carried(forward).unwrap());
        let backward = pdg.fetch_edge(nadd, nphi).expect("add feeds phi");
        assert!(pdg.is_loop_carried(backward).unwrap());
    }

    /// An array fully overwritten by a sub-loop each outer iteration: the
    /// outer RAW from the overwriting store to a later read is spurious
    /// once the point-to summary is available.
    fn overwriting_module() -> (Module, FunctionId, ValueId, ValueId) {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("main", 1, Type::Void);
        let b0 = mb.block(f); // entry
        let b1 = mb.block(f); // outer header
        let b2 = mb.block(f); // inner preheader
        let b3 = mb.block(f); // inner header
        let b4 = mb.block(f); // inner body + latch
        let b5 = mb.block(f); // after the sub-loop; outer latch
        let b6 = mb.block(f); // exit

        let arr = mb.alloca(f, b0, Type::Array { size: 4 });
        mb.br(f, b0, b1);
        let zero = mb.const_int(0);
        let ocond = mb.cmp(f, b1, CmpPred::Eq, mb.param(f, 0), zero);
        mb.cond_br(f, b1, ocond, b6, b2);
        mb.br(f, b2, b3);
        let one = mb.const_int(1);
        let four = mb.const_int(4);
        let i = mb.phi(f, b3, Type::Int);
        let icond = mb.cmp(f, b3, CmpPred::Eq, i, four);
        mb.cond_br(f, b3, icond, b5, b4);
        let gep = mb.gep(f, b4, arr, vec![i]);
        let five = mb.const_int(5);
        let store = mb.store(f, b4, five, gep);
        let next = mb.add(f, b4, i, one);
        mb.br(f, b4, b3);
        mb.add_phi_incoming(i, zero, b2);
        mb.add_phi_incoming(i, next, b4);
        let gep2 = mb.gep(f, b5, arr, vec![zero]);
        let read = mb.load(f, b5, gep2);
        mb.br(f, b5, b1);
        mb.ret(f, b6, None);
        (mb.finish(), f, store, read)
    }

    #[test]
    fn test_overwriting_recognizer_clears_raw() {
        let (m, f, store, read) = overwriting_module();
        let mut pdg =
            PdgBuilder::from_module(&m, &BaseObjectAliasOracle, &PdgOptions::default()).unwrap();
        classify_all(&m, f, &mut pdg, true);

        let ns = pdg.fetch_node(store).unwrap();
        let nr = pdg.fetch_node(read).unwrap();
        for e in pdg.edges_between(ns, nr) {
            let kind = pdg.edge_kind(e).unwrap();
            let (src, _) = pdg.edge_payloads(e).unwrap();
            if kind.is_memory() && kind.is_raw() && src == store {
                assert!(
                    !pdg.is_loop_carried(e).unwrap(),
                    "fully-overwritten array RAW must be cleared"
                );
            }
        }
    }

    #[test]
    fn test_without_point_to_stays_conservative() {
        let (m, f, store, read) = overwriting_module();
        let mut pdg =
            PdgBuilder::from_module(&m, &BaseObjectAliasOracle, &PdgOptions::default()).unwrap();
        classify_all(&m, f, &mut pdg, false);

        let ns = pdg.fetch_node(store).unwrap();
        let nr = pdg.fetch_node(read).unwrap();
        let mut saw_carried_raw = false;
        for e in pdg.edges_between(ns, nr) {
            let kind = pdg.edge_kind(e).unwrap();
            let (src, _) = pdg.edge_payloads(e).unwrap();
            if kind.is_memory() && kind.is_raw() && src == store {
                saw_carried_raw |= pdg.is_loop_carried(e).unwrap();
            }
        }
        assert!(saw_carried_raw, "without point-to the RAW stays carried");
    }

    #[test]
    fn test_classify_rejects_preset_flags() {
        let (m, f, _, _) = overwriting_module();
        let mut pdg =
            PdgBuilder::from_module(&m, &BaseObjectAliasOracle, &PdgOptions::default()).unwrap();
        let first = pdg.edges()[0];
        pdg.set_loop_carried(first, true).unwrap();

        let doms = DominatorSummary::new(&m, f);
        let forest = LoopForest::new(&m, f, &doms);
        let top = forest.roots()[0];
        let result = LoopCarriedDependences::classify(
            &m,
            &forest,
            top,
            &doms,
            &mut pdg,
            None,
            Verbosity::Disabled,
        );
        assert!(matches!(result, Err(WeftError::InvariantViolation { .. })));
    }
}
