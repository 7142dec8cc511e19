//! Second-order biased (node2vec) random walks over an edge-list graph.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use stampede::cli::{self, WalkArgs};

#[derive(Debug, Parser)]
#[command(about = "Massively parallel node2vec random walks")]
struct Args {
    #[command(flatten)]
    walk: WalkArgs,

    /// Return parameter p.
    #[arg(short = 'p', long, default_value_t = 1.0)]
    p: f32,

    /// In-out parameter q.
    #[arg(short = 'q', long, default_value_t = 1.0)]
    q: f32,
}

fn main() -> ExitCode {
    cli::init_logging();
    let args = Args::parse();
    match cli::run_walk(&args.walk, Some((args.p, args.q))) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
