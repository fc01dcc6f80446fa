//! PDG construction
//!
//! Populates one node per function argument and per instruction, then adds
//! the three edge families:
//!
//! 1. def-use edges from the module's use lists (register RAW, must);
//! 2. memory edges from the alias oracle: store/store WAW pairs,
//!    store/load RAW with the WAR reverse, and mod/ref edges around calls;
//! 3. control edges from the post-dominance relation: the terminator of a
//!    block A gains a control edge to every instruction of each block B
//!    that is control-dependent on A.
//!
//! Traversal order is fixed (functions in declaration order, blocks and
//! instructions in listed order) so edge insertion is deterministic.

use super::Pdg;
use crate::diagnostics::Verbosity;
use crate::error::Result;
use crate::graph::{DataKind, DepGraph};
use crate::ir::alias::{AliasOracle, AliasResult, ModRefResult};
use crate::ir::dominators::DominatorSummary;
use crate::ir::{classify_external, Callee, ExternalKind, FunctionId, InstKind, Module, Value, ValueId};
use tracing::debug;

/// Construction-time options.
#[derive(Debug, Clone)]
pub struct PdgOptions {
    /// Name of the entry function whose first instruction becomes the
    /// graph entry; falls back to `main`, then to the first function.
    pub entry_function: Option<String>,
    pub verbosity: Verbosity,
}

impl Default for PdgOptions {
    fn default() -> Self {
        PdgOptions {
            entry_function: None,
            verbosity: Verbosity::Disabled,
        }
    }
}

/// Builds [`Pdg`]s from modules, functions, or value sets.
pub struct PdgBuilder;

impl PdgBuilder {
    /// Build the whole-module PDG.
    pub fn from_module<A: AliasOracle>(
        module: &Module,
        alias: &A,
        options: &PdgOptions,
    ) -> Result<Pdg> {
        let mut graph = DepGraph::new();
        for f in module.function_ids() {
            populate_function_nodes(&mut graph, module, f);
        }
        construct_use_def_edges(&mut graph, module)?;
        for f in module.function_ids() {
            if module.function(f).is_empty() {
                continue;
            }
            construct_memory_edges(&mut graph, module, f, alias)?;
            let doms = DominatorSummary::new(module, f);
            construct_control_edges(&mut graph, module, f, &doms)?;
        }

        let entry_function = options
            .entry_function
            .as_deref()
            .and_then(|name| module.function_named(name))
            .or_else(|| module.function_named("main"))
            .or_else(|| module.function_ids().next());
        if let Some(f) = entry_function {
            if let Some(entry) = module.entry_instruction(f) {
                // An ephemeral first instruction has no node; leave the
                // entry unset in that case.
                if let Some(node) = graph.fetch_node(entry) {
                    graph.set_entry_node(node)?;
                }
            }
        }

        if options.verbosity >= Verbosity::Minimal {
            debug!(
                nodes = graph.num_nodes(),
                edges = graph.num_edges(),
                "constructed module PDG"
            );
        }
        Ok(Pdg::from_graph(graph))
    }

    /// Build a PDG restricted to one function.
    pub fn from_function<A: AliasOracle>(
        module: &Module,
        function: FunctionId,
        alias: &A,
        options: &PdgOptions,
    ) -> Result<Pdg> {
        let mut graph = DepGraph::new();
        populate_function_nodes(&mut graph, module, function);
        construct_use_def_edges(&mut graph, module)?;
        if !module.function(function).is_empty() {
            construct_memory_edges(&mut graph, module, function, alias)?;
            let doms = DominatorSummary::new(module, function);
            construct_control_edges(&mut graph, module, function, &doms)?;
        }
        if let Some(entry) = module.entry_instruction(function) {
            if let Some(node) = graph.fetch_node(entry) {
                graph.set_entry_node(node)?;
            }
        }
        if options.verbosity >= Verbosity::Minimal {
            debug!(
                function = %module.function(function).name,
                nodes = graph.num_nodes(),
                edges = graph.num_edges(),
                "constructed function PDG"
            );
        }
        Ok(Pdg::from_graph(graph))
    }
}

/// Lifetime markers and other ephemeral intrinsics get no node.
fn is_ephemeral(inst_kind: &InstKind) -> bool {
    matches!(
        inst_kind,
        InstKind::Call {
            callee: Callee::External(name),
            ..
        } if classify_external(name) == ExternalKind::Intrinsic
    )
}

fn populate_function_nodes(graph: &mut DepGraph<ValueId>, module: &Module, function: FunctionId) {
    // A declaration without a body contributes nothing.
    if module.function(function).is_empty() {
        return;
    }
    for arg in &module.function(function).params {
        graph.fetch_or_add_node(*arg, true);
    }
    for inst in module.instructions_of(function) {
        let kind = &module.inst(inst).expect("instruction value").kind;
        if is_ephemeral(kind) {
            continue;
        }
        graph.fetch_or_add_node(inst, true);
    }
}

/// Register def-use edges. Constants, globals, and function references
/// are not graph nodes, so uses of them are skipped by the presence check.
fn construct_use_def_edges(graph: &mut DepGraph<ValueId>, module: &Module) -> Result<()> {
    let users = module.def_use();
    let mut defs: Vec<ValueId> = users.keys().copied().collect();
    defs.sort();
    for def in defs {
        if !graph.is_in_graph(def) {
            continue;
        }
        for user in &users[&def] {
            if !graph.is_in_graph(*user) {
                continue;
            }
            if !matches!(module.value(*user), Value::Inst(_) | Value::Argument { .. }) {
                continue;
            }
            let edge = graph.add_edge(def, *user)?;
            graph.set_data_dependence(edge, DataKind::Raw, false, true)?;
        }
    }
    Ok(())
}

fn construct_memory_edges<A: AliasOracle>(
    graph: &mut DepGraph<ValueId>,
    module: &Module,
    function: FunctionId,
    alias: &A,
) -> Result<()> {
    let insts = module.instructions_of(function);
    let stores: Vec<ValueId> = filter_kind(module, &insts, |k| matches!(k, InstKind::Store { .. }));
    let loads: Vec<ValueId> = filter_kind(module, &insts, |k| matches!(k, InstKind::Load { .. }));
    let calls: Vec<ValueId> = insts
        .iter()
        .copied()
        .filter(|v| {
            let kind = &module.inst(*v).expect("instruction").kind;
            matches!(kind, InstKind::Call { .. }) && !is_ephemeral(kind)
        })
        .collect();

    // Store pairs: symmetric WAW.
    for (i, s1) in stores.iter().enumerate() {
        for s2 in stores.iter().skip(i + 1) {
            if let Some(must) = alias_decision(alias.alias(module, *s1, *s2)) {
                add_memory_edge(graph, *s1, *s2, DataKind::Waw, must)?;
                add_memory_edge(graph, *s2, *s1, DataKind::Waw, must)?;
            }
        }
    }

    // Store/load pairs: RAW forward, WAR reverse.
    for s in &stores {
        for l in &loads {
            if let Some(must) = alias_decision(alias.alias(module, *s, *l)) {
                add_memory_edge(graph, *s, *l, DataKind::Raw, must)?;
                add_memory_edge(graph, *l, *s, DataKind::War, must)?;
            }
        }
    }

    // Calls against stores: a reading call is ordered with the store both
    // ways; a writing call forms a WAW pair with it.
    for call in &calls {
        for s in &stores {
            let (reads, writes) = mod_ref_decision(alias.mod_ref_with_location(module, *call, *s));
            if reads {
                add_memory_edge(graph, *s, *call, DataKind::Raw, false)?;
                add_memory_edge(graph, *call, *s, DataKind::War, false)?;
            }
            if writes {
                add_memory_edge(graph, *s, *call, DataKind::Waw, false)?;
                add_memory_edge(graph, *call, *s, DataKind::Waw, false)?;
            }
        }

        // Calls against loads: only a writing call matters (read/read pairs
        // impose no order).
        for l in &loads {
            let (_, writes) = mod_ref_decision(alias.mod_ref_with_location(module, *call, *l));
            if writes {
                add_memory_edge(graph, *call, *l, DataKind::Raw, false)?;
                add_memory_edge(graph, *l, *call, DataKind::War, false)?;
            }
        }
    }

    // Call pairs, each direction judged by what `b` does to `a`'s
    // locations.
    for a in &calls {
        for b in &calls {
            if a == b {
                continue;
            }
            let (reads, writes) = mod_ref_decision(alias.mod_ref_with_call(module, *b, *a));
            if reads {
                add_memory_edge(graph, *b, *a, DataKind::War, false)?;
                add_memory_edge(graph, *a, *b, DataKind::Raw, false)?;
            }
            if writes {
                add_memory_edge(graph, *a, *b, DataKind::Waw, false)?;
            }
        }
    }

    Ok(())
}

fn filter_kind(
    module: &Module,
    insts: &[ValueId],
    pred: impl Fn(&InstKind) -> bool,
) -> Vec<ValueId> {
    insts
        .iter()
        .copied()
        .filter(|v| pred(&module.inst(*v).expect("instruction").kind))
        .collect()
}

/// `Some(must)` when the alias answer requires an edge.
fn alias_decision(result: AliasResult) -> Option<bool> {
    match result {
        AliasResult::No => None,
        AliasResult::May | AliasResult::Partial => Some(false),
        AliasResult::Must => Some(true),
    }
}

/// (reads, writes) of a mod/ref answer.
fn mod_ref_decision(result: ModRefResult) -> (bool, bool) {
    match result {
        ModRefResult::NoModRef => (false, false),
        ModRefResult::Ref => (true, false),
        ModRefResult::Mod => (false, true),
        ModRefResult::ModRef => (true, true),
    }
}

fn add_memory_edge(
    graph: &mut DepGraph<ValueId>,
    src: ValueId,
    dst: ValueId,
    dep: DataKind,
    must: bool,
) -> Result<()> {
    let edge = graph.add_edge(src, dst)?;
    graph.set_data_dependence(edge, dep, true, must)
}

/// B is control-dependent on A iff A has a successor A' with B
/// post-dominating A' but not post-dominating A. Phrased over the
/// post-dominator tree: for every block D that B post-dominates, every
/// predecessor P of D that B does not strictly post-dominate contributes
/// edges from P's terminator to each instruction of B.
fn construct_control_edges(
    graph: &mut DepGraph<ValueId>,
    module: &Module,
    function: FunctionId,
    doms: &DominatorSummary,
) -> Result<()> {
    let f = module.function(function);
    for b in f.block_ids() {
        for dominated in doms.post_dominated_descendants(b) {
            for pred in module.predecessors(function, dominated) {
                if doms.strictly_post_dominates_block(b, pred) {
                    continue;
                }
                let Some(terminator) = module.terminator_of(function, pred) else {
                    continue;
                };
                for inst in &f.block(b).insts {
                    if !graph.is_in_graph(*inst) || !graph.is_in_graph(terminator) {
                        continue;
                    }
                    let edge = graph.add_edge(terminator, *inst)?;
                    graph.set_control_dependence(edge)?;
                }
            }
        }
    }
    Ok(())
}
