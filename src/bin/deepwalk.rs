//! Uniform (DeepWalk-style) random walks over an edge-list graph.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use stampede::cli::{self, WalkArgs};

#[derive(Debug, Parser)]
#[command(about = "Massively parallel uniform random walks")]
struct Args {
    #[command(flatten)]
    walk: WalkArgs,
}

fn main() -> ExitCode {
    cli::init_logging();
    let args = Args::parse();
    match cli::run_walk(&args.walk, None) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
