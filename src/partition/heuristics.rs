//! Cost-directed partition merging
//!
//! A cost analysis walks the stage graph breadth-first from the stages
//! with no incoming edges and asks its strategy, for every dependent and
//! sibling pair, whether that pair is the best merge seen this round. The
//! driver then commits the best candidate and repeats until a round
//! records nothing.
//!
//! Two strategies:
//!
//! - [`MinMaxSizeAnalysis`] minimizes the cost of the most expensive
//!   stage and hard-stops once the stage count fits the core budget;
//! - [`SmallestSizeAnalysis`] greedily maximizes the total cost lowered
//!   by a merge, refusing merges whose combined stage would exceed a
//!   configurable fraction of the whole pipeline's cost.
//!
//! Candidate pair costs are computed over the *full forced co-merge set*,
//! so a pair whose merge would drag intermediate stages along is priced
//! accordingly.

use super::cost::InvocationLatency;
use super::{Partition, StageId};
use crate::diagnostics::Verbosity;
use crate::error::Result;
use crate::ir::Module;
use crate::scc::{SccDag, SccId};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::debug;

/// Per-round cost tables plus the best candidate recorded so far.
struct CostState {
    stage_cost: HashMap<StageId, u64>,
    stage_inst_count: HashMap<StageId, u64>,
    total_cost: u64,
    candidate: Option<(StageId, StageId)>,
    candidate_merged_cost: u64,
    candidate_lowered_cost: u64,
    candidate_inst_count: u64,
}

impl CostState {
    fn new(
        module: &Module,
        dag: &SccDag,
        latency: &mut InvocationLatency,
        partition: &Partition,
    ) -> CostState {
        let mut stage_cost = HashMap::new();
        let mut stage_inst_count = HashMap::new();
        let mut total_cost = 0u64;
        for stage in partition.stage_ids() {
            let sccs = &partition.stage(stage).sccs;
            let cost = latency.stage_latency(module, dag, &[sccs]);
            let insts: u64 = sccs
                .iter()
                .map(|s| dag.scc(*s).number_of_instructions() as u64)
                .sum();
            total_cost += cost;
            stage_cost.insert(stage, cost);
            stage_inst_count.insert(stage, insts);
        }
        CostState {
            stage_cost,
            stage_inst_count,
            total_cost,
            candidate: None,
            candidate_merged_cost: u64::MAX,
            candidate_lowered_cost: 0,
            candidate_inst_count: u64::MAX,
        }
    }

    /// Cost and instruction count of collapsing a co-merge set into one
    /// stage.
    fn merged_metrics(
        &self,
        module: &Module,
        dag: &SccDag,
        latency: &mut InvocationLatency,
        partition: &Partition,
        group: &BTreeSet<StageId>,
    ) -> (u64, u64, u64) {
        let mut combined: BTreeSet<SccId> = BTreeSet::new();
        let mut current = 0u64;
        let mut insts = 0u64;
        for stage in group {
            combined.extend(partition.stage(*stage).sccs.iter().copied());
            current += self.stage_cost[stage];
            insts += self.stage_inst_count[stage];
        }
        let merged = latency.stage_latency(module, dag, &[&combined]);
        (merged, current.saturating_sub(merged), insts)
    }
}

/// A merge-selection strategy invoked for every candidate pair.
trait MergeCriterion {
    fn check_if_should_merge(
        &self,
        state: &mut CostState,
        module: &Module,
        dag: &SccDag,
        latency: &mut InvocationLatency,
        partition: &Partition,
        num_cores: usize,
        verbosity: Verbosity,
        a: StageId,
        b: StageId,
    ) -> Result<()>;
}

/// Balance the largest stage: prefer the merge producing the cheapest
/// combined stage, with ties broken toward fewer instructions.
pub struct MinMaxSizeAnalysis;

impl MergeCriterion for MinMaxSizeAnalysis {
    #[allow(clippy::too_many_arguments)]
    fn check_if_should_merge(
        &self,
        state: &mut CostState,
        module: &Module,
        dag: &SccDag,
        latency: &mut InvocationLatency,
        partition: &Partition,
        num_cores: usize,
        verbosity: Verbosity,
        a: StageId,
        b: StageId,
    ) -> Result<()> {
        // Hard stop once the pipeline fits the cores.
        if partition.num_stages() <= num_cores {
            return Ok(());
        }
        if !partition.can_merge(a, b) {
            return Ok(());
        }
        let group = partition.cycle_introduced_by_merging(a, b)?;
        let (merged, lowered, insts) =
            state.merged_metrics(module, dag, latency, partition, &group);

        if verbosity >= Verbosity::Maximal {
            debug!(?a, ?b, merged, lowered, insts, "minmax candidate");
        }

        if merged > state.candidate_merged_cost {
            return Ok(());
        }
        if merged == state.candidate_merged_cost && insts > state.candidate_inst_count {
            return Ok(());
        }
        state.candidate = Some((a, b));
        state.candidate_merged_cost = merged;
        state.candidate_lowered_cost = lowered;
        state.candidate_inst_count = insts;
        Ok(())
    }
}

/// Options for the greedy total-cost strategy.
#[derive(Debug, Clone)]
pub struct SmallestSizeOptions {
    /// A merge is accepted only while the merged stage costs at most
    /// `merge_cost_factor` times the whole pipeline.
    pub merge_cost_factor: f64,
}

impl Default for SmallestSizeOptions {
    fn default() -> Self {
        SmallestSizeOptions {
            merge_cost_factor: 1.0,
        }
    }
}

/// Greedily lower the pipeline's total cost.
pub struct SmallestSizeAnalysis {
    pub options: SmallestSizeOptions,
}

impl MergeCriterion for SmallestSizeAnalysis {
    #[allow(clippy::too_many_arguments)]
    fn check_if_should_merge(
        &self,
        state: &mut CostState,
        module: &Module,
        dag: &SccDag,
        latency: &mut InvocationLatency,
        partition: &Partition,
        num_cores: usize,
        verbosity: Verbosity,
        a: StageId,
        b: StageId,
    ) -> Result<()> {
        if !partition.can_merge(a, b) {
            return Ok(());
        }
        if partition.num_stages() == num_cores {
            return Ok(());
        }
        let group = partition.cycle_introduced_by_merging(a, b)?;
        let (merged, lowered, insts) =
            state.merged_metrics(module, dag, latency, partition, &group);

        let budget = (state.total_cost as f64) * self.options.merge_cost_factor;
        if (merged as f64) > budget {
            return Ok(());
        }

        if verbosity >= Verbosity::Maximal {
            debug!(?a, ?b, merged, lowered, insts, "smallest-size candidate");
        }

        if lowered < state.candidate_lowered_cost {
            return Ok(());
        }
        if lowered == state.candidate_lowered_cost && insts > state.candidate_inst_count {
            return Ok(());
        }
        state.candidate = Some((a, b));
        state.candidate_merged_cost = merged;
        state.candidate_lowered_cost = lowered;
        state.candidate_inst_count = insts;
        Ok(())
    }
}

/// Entry points for the merging heuristics; owns the latency memo so
/// repeated invocations reuse SCC costs.
#[derive(Default)]
pub struct Heuristics {
    latency: InvocationLatency,
}

impl Heuristics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the min-max strategy to fixed point. Returns whether any merge
    /// was committed.
    pub fn min_max_merge(
        &mut self,
        module: &Module,
        dag: &SccDag,
        partition: &mut Partition,
        num_cores: usize,
        verbosity: Verbosity,
    ) -> Result<bool> {
        self.run(
            module,
            dag,
            partition,
            num_cores,
            verbosity,
            &MinMaxSizeAnalysis,
        )
    }

    /// Run the smallest-size strategy to fixed point.
    pub fn smallest_size_merge(
        &mut self,
        module: &Module,
        dag: &SccDag,
        partition: &mut Partition,
        num_cores: usize,
        verbosity: Verbosity,
        options: SmallestSizeOptions,
    ) -> Result<bool> {
        self.run(
            module,
            dag,
            partition,
            num_cores,
            verbosity,
            &SmallestSizeAnalysis { options },
        )
    }

    fn run<C: MergeCriterion>(
        &mut self,
        module: &Module,
        dag: &SccDag,
        partition: &mut Partition,
        num_cores: usize,
        verbosity: Verbosity,
        criterion: &C,
    ) -> Result<bool> {
        let mut modified_any = false;
        loop {
            let mut state = CostState::new(module, dag, &mut self.latency, partition);
            self.traverse_all_partition_stages(
                module,
                dag,
                partition,
                num_cores,
                verbosity,
                criterion,
                &mut state,
            )?;
            let Some((a, b)) = state.candidate else {
                break;
            };
            if verbosity >= Verbosity::Minimal {
                debug!(
                    ?a,
                    ?b,
                    merged_cost = state.candidate_merged_cost,
                    lowered_cost = state.candidate_lowered_cost,
                    "committing stage merge"
                );
            }
            partition.merge(a, b)?;
            modified_any = true;
        }
        Ok(modified_any)
    }

    /// BFS over the stage graph from its sources, checking every
    /// (stage, dependent) and (stage, sibling) pair.
    #[allow(clippy::too_many_arguments)]
    fn traverse_all_partition_stages<C: MergeCriterion>(
        &mut self,
        module: &Module,
        dag: &SccDag,
        partition: &Partition,
        num_cores: usize,
        verbosity: Verbosity,
        criterion: &C,
        state: &mut CostState,
    ) -> Result<()> {
        let mut worklist: VecDeque<StageId> = VecDeque::new();
        let mut enqueued: BTreeSet<StageId> = BTreeSet::new();
        for stage in partition.stages_with_no_incoming_edges() {
            worklist.push_back(stage);
            enqueued.insert(stage);
        }

        while let Some(stage) = worklist.pop_front() {
            let dependents = partition.dependent_ids(stage)?;
            let siblings = partition.sibling_ids(stage)?;
            for other in dependents.iter().chain(siblings.iter()) {
                criterion.check_if_should_merge(
                    state, module, dag, &mut self.latency, partition, num_cores, verbosity,
                    stage, *other,
                )?;
            }
            for next in dependents {
                if enqueued.insert(next) {
                    worklist.push_back(next);
                }
            }
        }
        Ok(())
    }
}
