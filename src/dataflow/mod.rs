//! Iterative dataflow analysis
//!
//! [`engine::DataFlowEngine`] runs a user-parameterized forward or
//! backward fixed point over one function; [`DataFlowResult`] holds the
//! per-instruction GEN/KILL/IN/OUT sets; [`analyses`] instantiates the
//! engine for the two canned problems downstream passes want
//! (reachability and liveness).

pub mod analyses;
pub mod engine;

pub use engine::DataFlowEngine;

use crate::ir::ValueId;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

fn empty_set() -> &'static HashSet<ValueId> {
    static EMPTY: OnceLock<HashSet<ValueId>> = OnceLock::new();
    EMPTY.get_or_init(HashSet::new)
}

/// Per-instruction GEN, KILL, IN, and OUT sets of one analysis run.
#[derive(Default)]
pub struct DataFlowResult {
    gen: HashMap<ValueId, HashSet<ValueId>>,
    kill: HashMap<ValueId, HashSet<ValueId>>,
    in_sets: HashMap<ValueId, HashSet<ValueId>>,
    out_sets: HashMap<ValueId, HashSet<ValueId>>,
}

impl DataFlowResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gen_of(&self, inst: ValueId) -> &HashSet<ValueId> {
        self.gen.get(&inst).unwrap_or_else(|| empty_set())
    }

    pub fn kill_of(&self, inst: ValueId) -> &HashSet<ValueId> {
        self.kill.get(&inst).unwrap_or_else(|| empty_set())
    }

    pub fn in_of(&self, inst: ValueId) -> &HashSet<ValueId> {
        self.in_sets.get(&inst).unwrap_or_else(|| empty_set())
    }

    pub fn out_of(&self, inst: ValueId) -> &HashSet<ValueId> {
        self.out_sets.get(&inst).unwrap_or_else(|| empty_set())
    }

    pub fn gen_mut(&mut self, inst: ValueId) -> &mut HashSet<ValueId> {
        self.gen.entry(inst).or_default()
    }

    pub fn kill_mut(&mut self, inst: ValueId) -> &mut HashSet<ValueId> {
        self.kill.entry(inst).or_default()
    }

    pub fn in_mut(&mut self, inst: ValueId) -> &mut HashSet<ValueId> {
        self.in_sets.entry(inst).or_default()
    }

    pub fn out_mut(&mut self, inst: ValueId) -> &mut HashSet<ValueId> {
        self.out_sets.entry(inst).or_default()
    }

    /// IN(to) |= OUT(from): the union meet of a forward analysis.
    pub fn union_out_into_in(&mut self, from: ValueId, to: ValueId) {
        let incoming: Vec<ValueId> = self.out_of(from).iter().copied().collect();
        self.in_mut(to).extend(incoming);
    }

    /// OUT(to) |= IN(from): the union meet of a backward analysis.
    pub fn union_in_into_out(&mut self, from: ValueId, to: ValueId) {
        let incoming: Vec<ValueId> = self.in_of(from).iter().copied().collect();
        self.out_mut(to).extend(incoming);
    }

    /// OUT(i) = GEN(i) ∪ (IN(i) − KILL(i)).
    pub fn transfer_forward(&mut self, inst: ValueId) {
        let mut out: HashSet<ValueId> = self
            .in_of(inst)
            .difference(self.kill_of(inst))
            .copied()
            .collect();
        out.extend(self.gen_of(inst).iter().copied());
        // Monotone growth for may analyses: never shrink OUT.
        self.out_mut(inst).extend(out);
    }

    /// IN(i) = GEN(i) ∪ (OUT(i) − KILL(i)).
    pub fn transfer_backward(&mut self, inst: ValueId) {
        let mut in_set: HashSet<ValueId> = self
            .out_of(inst)
            .difference(self.kill_of(inst))
            .copied()
            .collect();
        in_set.extend(self.gen_of(inst).iter().copied());
        self.in_mut(inst).extend(in_set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_entries_read_as_empty() {
        let df = DataFlowResult::new();
        assert!(df.in_of(ValueId(0)).is_empty());
        assert!(df.out_of(ValueId(0)).is_empty());
        assert!(df.gen_of(ValueId(0)).is_empty());
    }

    #[test]
    fn test_forward_transfer() {
        let mut df = DataFlowResult::new();
        df.in_mut(ValueId(0)).extend([ValueId(10), ValueId(11)]);
        df.kill_mut(ValueId(0)).insert(ValueId(10));
        df.gen_mut(ValueId(0)).insert(ValueId(12));
        df.transfer_forward(ValueId(0));
        let out = df.out_of(ValueId(0));
        assert!(out.contains(&ValueId(11)) && out.contains(&ValueId(12)));
        assert!(!out.contains(&ValueId(10)));
    }

    #[test]
    fn test_union_meets() {
        let mut df = DataFlowResult::new();
        df.out_mut(ValueId(0)).insert(ValueId(5));
        df.union_out_into_in(ValueId(0), ValueId(1));
        assert!(df.in_of(ValueId(1)).contains(&ValueId(5)));

        df.in_mut(ValueId(2)).insert(ValueId(6));
        df.union_in_into_out(ValueId(2), ValueId(3));
        assert!(df.out_of(ValueId(3)).contains(&ValueId(6)));
    }
}
