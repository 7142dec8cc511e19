//! # stampede
//!
//! A lock-step, NUMA-aware random-walk engine. Given a static graph, it moves
//! up to billions of walkers one edge at a time in bulk-synchronous steps and
//! emits a fixed-length vertex sequence per walker. Supported walk kinds are
//! uniform first-order walks (DeepWalk-style) and second-order biased walks
//! (node2vec) via rejection sampling.
//!
//! ## Design contract
//!
//! - **Bandwidth over instructions**: the per-step pipeline (shuffle walkers
//!   to the partition of their current vertex, sample, scatter back) exists
//!   to turn random graph access into mostly-sequential, socket-local access.
//! - **Adapt to the graph, once**: a self-calibrating micro-benchmark plus a
//!   multiple-choice-knapsack solver pick a partition layout and a sampler
//!   per partition before the first step; the hot loop never re-decides.
//! - **Pool-owned memory**: every hot-path buffer comes from a [`mem::MemoryPool`]
//!   arena placed on an explicit NUMA node; nothing grows during a walk.
//! - **Statistical correctness is testable**: empirical transition matrices
//!   must converge to the theoretical ones; see the `tests/` suite.
//!
//! ## References
//!
//! - Perozzi, Al-Rfou, Skiena (2014): DeepWalk.
//! - Grover & Leskovec (2016): node2vec (biased second-order random walks).
//! - Yang et al. (2019): rejection sampling for second-order walks, which
//!   replaces per-step alias tables with an accept/retry loop whose bound
//!   needs only `p`, `q`, and a neighborhood membership test.

pub mod bench;
pub mod bloom;
pub mod cli;
pub mod graph;
pub mod io;
pub mod mem;
pub mod message;
pub mod partition;
pub mod plan;
pub mod profiler;
pub mod rng;
pub mod sampler;
pub mod solver;
pub mod topo;
pub mod types;
pub mod walk;
pub mod walker;

pub use graph::Graph;
pub use plan::{make_graph, GraphHint, PlannerConfig, WalkerCount};
pub use solver::{Solver, SolverOptions};
pub use topo::{MachineInfo, ThreadConfig, Threads};
pub use types::{Edge, Eid, Pid, SamplerClass, Vid, Wid};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("invalid placement: {0}")]
    InvalidPlacement(String),
    #[error("topology mismatch: {0}")]
    TopologyMismatch(String),
    #[error("corrupt benchmark cache entry: {0}")]
    CorruptBenchmarkCache(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
