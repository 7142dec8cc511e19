//! Shared command-line surface for the `deepwalk` and `node2vec` binaries.

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use tracing::info;

use crate::io::{self, GraphFormat};
use crate::plan::{make_graph, PlannerConfig, WalkerCount};
use crate::solver::{Solver, SolverOptions};
use crate::topo::{MachineInfo, ThreadConfig, Threads};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Format {
    Binary,
    Text,
}

impl From<Format> for GraphFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Binary => GraphFormat::Binary,
            Format::Text => GraphFormat::Text,
        }
    }
}

#[derive(Debug, Args)]
pub struct WalkArgs {
    /// Graph file path.
    #[arg(short = 'g', long)]
    pub graph: PathBuf,

    /// Graph file format.
    #[arg(short = 'f', long, value_enum, default_value = "text")]
    pub format: Format,

    /// Worker threads (default: all cores of the selected sockets).
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// NUMA sockets to use (default: all).
    #[arg(short = 's', long)]
    pub sockets: Option<usize>,

    /// Logical-to-physical socket mapping, e.g. `--socket-mapping=2,3`.
    #[arg(long, value_delimiter = ',')]
    pub socket_mapping: Option<Vec<usize>>,

    /// Memory quota in GiB (default: 90% of RAM beyond the OS share).
    #[arg(long)]
    pub mem: Option<u64>,

    /// Vertices per emitted walk.
    #[arg(short = 'l', long)]
    pub walk_len: usize,

    /// Walks per vertex (exclusive with --walkers).
    #[arg(short = 'e', long, conflicts_with = "walkers")]
    pub epochs: Option<u64>,

    /// Total walker count (exclusive with --epochs).
    #[arg(short = 'w', long)]
    pub walkers: Option<u64>,

    /// Micro-benchmark cache directory.
    #[arg(long, default_value = "./.stampede")]
    pub bench_dir: PathBuf,

    /// Write walker-major paths (original names, u32 LE) here.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// PRNG seed for the walker streams.
    #[arg(long, default_value_t = 24)]
    pub seed: u64,
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Load the graph, plan, walk, and optionally write the paths.
pub fn run_walk(args: &WalkArgs, node2vec: Option<(f32, f32)>) -> Result<()> {
    let machine = MachineInfo::detect();
    let sockets = args.sockets.unwrap_or(machine.sockets);
    let requested_threads = args
        .threads
        .unwrap_or(machine.cores / machine.sockets * sockets)
        .max(sockets);
    let mut cfg = ThreadConfig::new(
        requested_threads - requested_threads % sockets,
        sockets,
        &machine,
    )?;
    if let Some(mapping) = args.socket_mapping.clone() {
        cfg = cfg.with_socket_mapping(mapping, &machine)?;
    }

    let mem_quota = match args.mem {
        Some(gib) => gib << 30,
        None => {
            let os_share = 1u64 << 31;
            machine.total_ram.saturating_sub(os_share) * 9 / 10 * sockets as u64
                / machine.sockets as u64
        }
    };
    let walkers = match (args.walkers, args.epochs) {
        (Some(w), None) => WalkerCount::Total(w),
        (None, Some(e)) => WalkerCount::PerVertex(e),
        _ => {
            return Err(Error::InvalidInput(
                "exactly one of --walkers and --epochs is required".into(),
            ))
        }
    };
    info!(
        threads = cfg.threads,
        sockets = cfg.sockets,
        mem_gib = mem_quota >> 30,
        "configuration"
    );

    let threads = Threads::new(cfg.clone())?;
    let edges = io::read_edges(&args.graph, args.format.into())?;
    let planner =
        PlannerConfig { cache_dir: args.bench_dir.clone(), ..PlannerConfig::default() };
    let graph = make_graph(
        edges,
        true,
        walkers,
        args.walk_len,
        mem_quota,
        node2vec.is_some(),
        &cfg,
        &threads,
        &planner,
    )?;

    let mut solver = Solver::new(
        &graph,
        &threads,
        SolverOptions {
            walker_num: walkers.resolve(graph.v_num),
            walk_len: args.walk_len,
            mem_quota,
            node2vec,
            seed: args.seed,
        },
    )?;
    let started = std::time::Instant::now();
    let walks = solver.run_to_vec()?;
    let seconds = started.elapsed().as_secs_f64();
    let steps = solver.terminated_walkers() * (args.walk_len as u64).saturating_sub(1).max(1);
    info!(
        walkers = solver.terminated_walkers(),
        seconds = format_args!("{seconds:.2}"),
        steps_per_second = format_args!("{:.3e}", steps as f64 / seconds),
        "walk finished"
    );

    if let Some(path) = &args.output {
        io::write_walks(path, &walks, graph.id2name())?;
        info!(path = %path.display(), "wrote walks");
    }
    Ok(())
}
