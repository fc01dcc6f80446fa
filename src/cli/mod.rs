// CLI command definitions and handlers

use crate::diagnostics::Verbosity;
use crate::graph::dot::{export_dot, write_dot_file};
use crate::ir::alias::{AliasOracle, BaseObjectAliasOracle, ConservativeAliasOracle};
use crate::ir::callgraph::CallGraph;
use crate::ir::dominators::DominatorSummary;
use crate::ir::loops::LoopForest;
use crate::ir::{FunctionId, Module};
use crate::lcd::LoopCarriedDependences;
use crate::partition::{Heuristics, Partition, SmallestSizeOptions};
use crate::pdg::refine::{remove_edges_not_used_by_parallel_schemes, RefineOptions};
use crate::pdg::{Pdg, PdgBuilder, PdgOptions};
use crate::pointsto::MayPointTo;
use crate::scc::SccDag;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

/// Weft - loop-parallelization middle-end
///
/// Builds dependence graphs over an SSA IR module and schedules their
/// strongly connected components into pipeline stages.
#[derive(Parser, Debug, Clone)]
#[command(name = "weft")]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the IR module (JSON)
    #[arg(global = true, long, env = "WEFT_MODULE")]
    pub module: Option<PathBuf>,

    /// Diagnostics verbosity (0 disabled, 1 minimal, 2 maximal)
    #[arg(global = true, long, default_value_t = 0)]
    pub verbose: u8,

    /// Output format
    #[arg(global = true, long, value_enum, default_value_t = OutputFormat::Human)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Human,
    /// Compact JSON for programmatic consumption
    Json,
    /// Formatted JSON with indentation
    Pretty,
}

/// Alias oracle selection
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasChoice {
    /// Separate accesses rooted at provably distinct allocations
    BaseObject,
    /// May-alias everything not proven identical
    Conservative,
}

/// Partition merging strategy
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyChoice {
    MinMax,
    SmallestSize,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build the program dependence graph
    Pdg(PdgArgs),

    /// Condense the PDG into its SCC DAG
    Sccdag(SccdagArgs),

    /// Partition the SCC DAG into pipeline stages
    Partition(PartitionArgs),

    /// Run the may-point-to analysis
    PointsTo(PointsToArgs),

    /// Classify loop-carried dependences of a function's outermost loop
    LoopCarried(LoopCarriedArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct PdgArgs {
    /// Restrict the graph to one function
    #[arg(long)]
    pub function: Option<String>,

    /// Alias oracle to consult for memory edges
    #[arg(long, value_enum, default_value_t = AliasChoice::BaseObject)]
    pub alias: AliasChoice,

    /// Drop edges the parallelization schemes never use
    #[arg(long)]
    pub refine: bool,

    /// Write the graph as Graphviz DOT to this file
    #[arg(long)]
    pub dot: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct SccdagArgs {
    /// Function to condense
    #[arg(long)]
    pub function: String,

    /// Alias oracle to consult for memory edges
    #[arg(long, value_enum, default_value_t = AliasChoice::BaseObject)]
    pub alias: AliasChoice,

    /// Absorb trivial PHI/GEP/cast singletons before reporting
    #[arg(long)]
    pub merge_trivial: bool,

    /// Write the condensation as Graphviz DOT to this file
    #[arg(long)]
    pub dot: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct PartitionArgs {
    /// Function to partition
    #[arg(long)]
    pub function: String,

    /// Core budget
    #[arg(long, default_value_t = 4)]
    pub cores: usize,

    /// Merging strategy
    #[arg(long, value_enum, default_value_t = StrategyChoice::MinMax)]
    pub strategy: StrategyChoice,

    /// Accept a merge only while the merged stage costs at most this
    /// fraction of the pipeline (smallest-size strategy)
    #[arg(long, default_value_t = 1.0)]
    pub merge_cost_factor: f64,
}

#[derive(Parser, Debug, Clone)]
pub struct PointsToArgs {}

#[derive(Parser, Debug, Clone)]
pub struct LoopCarriedArgs {
    /// Function whose outermost loop is classified
    #[arg(long)]
    pub function: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub fn run(cli: Cli) -> Result<()> {
    let module = load_module(&cli)?;
    let verbosity = Verbosity::from_level(cli.verbose);
    match &cli.command {
        Commands::Pdg(args) => cmd_pdg(&cli, &module, args, verbosity),
        Commands::Sccdag(args) => cmd_sccdag(&cli, &module, args, verbosity),
        Commands::Partition(args) => cmd_partition(&cli, &module, args, verbosity),
        Commands::PointsTo(args) => cmd_points_to(&cli, &module, args),
        Commands::LoopCarried(args) => cmd_loop_carried(&cli, &module, args, verbosity),
    }
}

fn load_module(cli: &Cli) -> Result<Module> {
    let path = cli
        .module
        .as_ref()
        .ok_or_else(|| anyhow!("--module is required (or set WEFT_MODULE)"))?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading module {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing module {}", path.display()))
}

fn function_named(module: &Module, name: &str) -> Result<FunctionId> {
    module
        .function_named(name)
        .ok_or_else(|| anyhow!("no function named '{name}' in the module"))
}

fn build_pdg(
    module: &Module,
    function: Option<FunctionId>,
    alias: AliasChoice,
    verbosity: Verbosity,
) -> Result<Pdg> {
    let options = PdgOptions {
        entry_function: None,
        verbosity,
    };
    let build = |oracle: &dyn AliasOracle| match function {
        Some(f) => PdgBuilder::from_function(module, f, &oracle, &options),
        None => PdgBuilder::from_module(module, &oracle, &options),
    };
    let pdg = match alias {
        AliasChoice::BaseObject => build(&BaseObjectAliasOracle),
        AliasChoice::Conservative => build(&ConservativeAliasOracle),
    }?;
    Ok(pdg)
}

#[derive(Debug, Serialize)]
struct GraphReport {
    nodes: usize,
    internal_nodes: usize,
    external_nodes: usize,
    edges: usize,
    memory_edges: usize,
    control_edges: usize,
    loop_carried_edges: usize,
}

fn graph_report(pdg: &Pdg) -> GraphReport {
    let mut memory = 0;
    let mut control = 0;
    let mut carried = 0;
    for e in pdg.edges() {
        let kind = pdg.edge_kind(e).expect("live edge");
        if kind.is_memory() {
            memory += 1;
        }
        if kind.is_control() {
            control += 1;
        }
        if pdg.is_loop_carried(e).unwrap_or(false) {
            carried += 1;
        }
    }
    GraphReport {
        nodes: pdg.num_nodes(),
        internal_nodes: pdg.num_internal_nodes(),
        external_nodes: pdg.num_external_nodes(),
        edges: pdg.num_edges(),
        memory_edges: memory,
        control_edges: control,
        loop_carried_edges: carried,
    }
}

fn emit<T: Serialize + std::fmt::Debug>(cli: &Cli, value: &T) -> Result<()> {
    match cli.output {
        OutputFormat::Human => println!("{value:#?}"),
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Pretty => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn cmd_pdg(cli: &Cli, module: &Module, args: &PdgArgs, verbosity: Verbosity) -> Result<()> {
    let function = args
        .function
        .as_deref()
        .map(|name| function_named(module, name))
        .transpose()?;
    let mut pdg = build_pdg(module, function, args.alias, verbosity)?;

    if args.refine {
        let call_graph = CallGraph::new(module);
        let mut options = RefineOptions::parallelizer();
        options.verbosity = verbosity;
        let removed =
            remove_edges_not_used_by_parallel_schemes(&mut pdg, module, &call_graph, &options);
        tracing::info!(removed, "parallelization-oriented refinement");
    }

    if let Some(path) = &args.dot {
        let dot = export_dot(pdg.graph(), "pdg", |v| Pdg::value_label(module, v));
        write_dot_file(path, &dot, verbosity);
    }
    emit(cli, &graph_report(&pdg))
}

#[derive(Debug, Serialize)]
struct SccdagReport {
    sccs: usize,
    internal_sccs: usize,
    edges: usize,
    sequential_sccs: usize,
    largest_scc: usize,
    topological_order_len: usize,
}

fn cmd_sccdag(cli: &Cli, module: &Module, args: &SccdagArgs, verbosity: Verbosity) -> Result<()> {
    let function = function_named(module, &args.function)?;
    let pdg = build_pdg(module, Some(function), args.alias, verbosity)?;
    let mut dag = SccDag::from_pdg(&pdg)?;
    if args.merge_trivial {
        dag.merge_single_syntactic_sugar_sccs(&pdg, module)?;
        dag.merge_tail_branches(&pdg, module)?;
    }
    let order = dag.topological_order()?;

    if let Some(path) = &args.dot {
        let dot = export_dot(dag.graph(), "sccdag", |id| {
            format!("scc{} ({} values)", id.0, dag.scc(id).number_of_instructions())
        });
        write_dot_file(path, &dot, verbosity);
    }

    let internal = dag.internal_sccs();
    let report = SccdagReport {
        sccs: dag.num_sccs(),
        internal_sccs: internal.len(),
        edges: dag.graph().num_edges(),
        sequential_sccs: internal
            .iter()
            .filter(|id| dag.scc(**id).kind() == crate::scc::SccKind::Sequential)
            .count(),
        largest_scc: internal
            .iter()
            .map(|id| dag.scc(*id).number_of_instructions())
            .max()
            .unwrap_or(0),
        topological_order_len: order.len(),
    };
    emit(cli, &report)
}

#[derive(Debug, Serialize)]
struct PartitionReport {
    initial_stages: usize,
    final_stages: usize,
    modified: bool,
    stage_sizes: Vec<usize>,
}

fn cmd_partition(
    cli: &Cli,
    module: &Module,
    args: &PartitionArgs,
    verbosity: Verbosity,
) -> Result<()> {
    let function = function_named(module, &args.function)?;
    let pdg = build_pdg(module, Some(function), AliasChoice::BaseObject, verbosity)?;
    let mut dag = SccDag::from_pdg(&pdg)?;
    dag.merge_single_syntactic_sugar_sccs(&pdg, module)?;
    dag.merge_tail_branches(&pdg, module)?;

    let mut partition = Partition::new(&dag)?;
    let initial = partition.num_stages();
    let mut heuristics = Heuristics::new();
    let modified = match args.strategy {
        StrategyChoice::MinMax => {
            heuristics.min_max_merge(module, &dag, &mut partition, args.cores, verbosity)?
        }
        StrategyChoice::SmallestSize => heuristics.smallest_size_merge(
            module,
            &dag,
            &mut partition,
            args.cores,
            verbosity,
            SmallestSizeOptions {
                merge_cost_factor: args.merge_cost_factor,
            },
        )?,
    };
    partition.verify_acyclic()?;

    let report = PartitionReport {
        initial_stages: initial,
        final_stages: partition.num_stages(),
        modified,
        stage_sizes: partition
            .stage_ids()
            .iter()
            .map(|s| partition.stage(*s).sccs.len())
            .collect(),
    };
    emit(cli, &report)
}

#[derive(Debug, Serialize)]
struct PointsToReport {
    functions_analyzed: usize,
    per_function_pointer_counts: Vec<(String, usize)>,
}

fn cmd_points_to(cli: &Cli, module: &Module, _args: &PointsToArgs) -> Result<()> {
    let call_graph = CallGraph::new(module);
    let summary = MayPointTo::analyze(module, &call_graph)?;
    let mut per_function = Vec::new();
    for f in module.function_ids() {
        if let Some(fs) = summary.function_summary(f) {
            let mut pointers = 0usize;
            for v in module.instructions_of(f) {
                if !fs
                    .graph
                    .pointees(crate::pointsto::Pointer::Variable(v))
                    .is_empty()
                {
                    pointers += 1;
                }
            }
            per_function.push((module.function(f).name.clone(), pointers));
        }
    }
    let report = PointsToReport {
        functions_analyzed: per_function.len(),
        per_function_pointer_counts: per_function,
    };
    emit(cli, &report)
}

#[derive(Debug, Serialize)]
struct LoopCarriedReport {
    loops: usize,
    edges: usize,
    loop_carried_edges: usize,
}

fn cmd_loop_carried(
    cli: &Cli,
    module: &Module,
    args: &LoopCarriedArgs,
    verbosity: Verbosity,
) -> Result<()> {
    let function = function_named(module, &args.function)?;
    let mut pdg = build_pdg(module, Some(function), AliasChoice::BaseObject, verbosity)?;
    let doms = DominatorSummary::new(module, function);
    let forest = LoopForest::new(module, function, &doms);
    let Some(top) = forest.roots().first().copied() else {
        return Err(anyhow!("function '{}' has no loops", args.function));
    };
    let call_graph = CallGraph::new(module);
    let point_to = MayPointTo::analyze(module, &call_graph)?;
    LoopCarriedDependences::classify(
        module,
        &forest,
        top,
        &doms,
        &mut pdg,
        Some(&point_to),
        verbosity,
    )?;

    let carried = pdg
        .edges()
        .iter()
        .filter(|e| pdg.is_loop_carried(**e).unwrap_or(false))
        .count();
    let report = LoopCarriedReport {
        loops: forest.len(),
        edges: pdg.num_edges(),
        loop_carried_edges: carried,
    };
    emit(cli, &report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_dot_name_helper_available() {
        assert!(crate::graph::dot::dot_file_name("pdg", 1).ends_with(".dot"));
    }
}
