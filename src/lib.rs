// Weft: loop-parallelization middle-end for SSA-form IR
//
// Builds program dependence graphs, condenses them into SCC DAGs,
// partitions SCCs into pipeline stages under a latency model, and refines
// dependence edges with dataflow, loop-carried-dependence, and
// may-point-to analyses.

#![allow(dead_code)]

pub mod cli;
pub mod dataflow;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod ir;
pub mod lcd;
pub mod partition;
pub mod pdg;
pub mod pointsto;
pub mod scc;

pub use diagnostics::Verbosity;
pub use error::{Result, WeftError};
