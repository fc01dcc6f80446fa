//! Scalar-evolution oracle
//!
//! A deliberately small recognizer: it answers whether a value is a
//! compile-time constant, a monotonic add-recurrence (an induction
//! variable of some loop), or neither. The dependence refinements use it
//! only to decide whether a GEP's indices are constant-or-IV.

use super::loops::LoopForest;
use super::{BinaryOp, FunctionId, InstKind, Module, Value, ValueId};

/// Classification of a value's evolution across loop iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScevKind {
    Constant,
    /// Header PHI stepped by a loop-invariant constant, or the add feeding
    /// such a PHI.
    AddRec,
    Other,
}

/// Per-function induction-variable recognition.
pub struct ScalarEvolution<'a> {
    module: &'a Module,
    function: FunctionId,
    forest: &'a LoopForest,
}

impl<'a> ScalarEvolution<'a> {
    pub fn new(module: &'a Module, function: FunctionId, forest: &'a LoopForest) -> Self {
        ScalarEvolution {
            module,
            function,
            forest,
        }
    }

    pub fn scev_kind(&self, value: ValueId) -> ScevKind {
        if matches!(self.module.value(value), Value::ConstantInt(_)) {
            return ScevKind::Constant;
        }
        if self.is_induction_phi(value) || self.is_induction_step(value) {
            return ScevKind::AddRec;
        }
        ScevKind::Other
    }

    /// A header PHI with exactly two incomings: a loop-invariant start and
    /// a constant-stepped add of itself from inside the loop.
    fn is_induction_phi(&self, value: ValueId) -> bool {
        let Some(inst) = self.module.inst(value) else {
            return false;
        };
        if inst.function != self.function {
            return false;
        }
        let InstKind::Phi { incoming } = &inst.kind else {
            return false;
        };
        let Some(loop_id) = self.forest.innermost_containing_inst(self.module, value) else {
            return false;
        };
        let l = self.forest.get(loop_id);
        if inst.block != l.header || incoming.len() != 2 {
            return false;
        }
        let mut start_ok = false;
        let mut step_ok = false;
        for (v, from) in incoming {
            if l.body.contains(from) {
                step_ok = self.is_constant_step_of(*v, value);
            } else {
                start_ok = !l.contains_inst(self.module, *v);
            }
        }
        start_ok && step_ok
    }

    /// `add(phi, c)` or `sub(phi, c)` with a constant c.
    fn is_constant_step_of(&self, step: ValueId, phi: ValueId) -> bool {
        let Some(inst) = self.module.inst(step) else {
            return false;
        };
        let InstKind::Binary { op, lhs, rhs } = &inst.kind else {
            return false;
        };
        if !matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            return false;
        }
        let constant = |v: ValueId| matches!(self.module.value(v), Value::ConstantInt(_));
        (*lhs == phi && constant(*rhs)) || (*rhs == phi && constant(*lhs) && *op == BinaryOp::Add)
    }

    /// The add/sub instruction that advances some induction PHI.
    fn is_induction_step(&self, value: ValueId) -> bool {
        let Some(inst) = self.module.inst(value) else {
            return false;
        };
        let InstKind::Binary { lhs, rhs, .. } = &inst.kind else {
            return false;
        };
        [*lhs, *rhs]
            .into_iter()
            .any(|op| self.is_induction_phi(op))
            && self
                .forest
                .innermost_containing_inst(self.module, value)
                .is_some()
            && inst.function == self.function
    }

    /// All GEP indices constant, or governed by induction variables.
    pub fn gep_indices_constant_or_iv(&self, gep: ValueId) -> bool {
        let Some(inst) = self.module.inst(gep) else {
            return false;
        };
        let InstKind::Gep { indices, .. } = &inst.kind else {
            return false;
        };
        indices
            .iter()
            .all(|idx| matches!(self.scev_kind(*idx), ScevKind::Constant | ScevKind::AddRec))
    }
}
