// Weft: loop-parallelization middle-end for SSA-form IR
//
// Loads an IR module, builds its dependence graphs, and schedules their
// strongly connected components into pipeline stages.

use anyhow::Result;
use clap::Parser;

use weft::cli::{self, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    cli::run(cli)
}
