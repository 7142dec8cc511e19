//! Partition planning: turn micro-benchmark measurements into a concrete
//! partition layout and per-partition sampler choice.
//!
//! The vertex range splits into groups of `1 << group_bits` vertices. Each
//! group independently offers one candidate per admissible partition size;
//! a candidate's cost is the estimated time for all walkers on the group's
//! vertices to take one step. Picking exactly one candidate per group under
//! a global partition budget is the multiple-choice knapsack problem,
//! solved by dynamic programming over (group, partitions-used).

use std::path::PathBuf;

use tracing::info;

use crate::bench::{mini_benchmark, CostTable};
use crate::bloom::BloomFilter;
use crate::graph::{AdjList, AdjUnit, EdgeListGraph, Graph};
use crate::topo::{ThreadConfig, Threads};
use crate::types::{Edge, Eid, SamplerClass, Vid, Wid};
use crate::{Error, Result};

/// Planner tunables. Passed explicitly; nothing reads ambient globals.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Micro-benchmark cache directory.
    pub cache_dir: PathBuf,
    /// Upper bound on the number of vertex groups.
    pub max_group_num: Vid,
    /// Smallest admissible `partition_bits`.
    pub min_partition_bits: u32,
    /// Largest admissible `partition_bits`.
    pub max_partition_bits: u32,
    /// Knapsack capacity: total partitions across all groups.
    pub max_partition_num: usize,
    /// Largest degree the micro-benchmark synthesizes.
    pub max_bench_degree: Vid,
    /// Synthetic edges per benchmark thread.
    pub bench_edges_per_thread: u64,
    /// Partition sizes above this are extrapolated from the boundary row.
    pub bench_internal_max_bits: u32,
    /// Minimum samples per benchmark measurement.
    pub bench_min_samples: u64,
    /// Cap on the walker array driving one measurement; high densities
    /// re-run the loop instead of growing the array.
    pub bench_max_walkers: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./.stampede"),
            max_group_num: 128,
            min_partition_bits: 4,
            max_partition_bits: 24,
            max_partition_num: 2048,
            max_bench_degree: 2048,
            bench_edges_per_thread: 1 << 24,
            bench_internal_max_bits: 20,
            bench_min_samples: 1 << 20,
            bench_max_walkers: 1 << 24,
        }
    }
}

impl PlannerConfig {
    /// Reduced budgets for small graphs and constrained machines; the
    /// benchmark completes in well under a second.
    pub fn small() -> Self {
        Self {
            cache_dir: PathBuf::from("./.stampede"),
            max_group_num: 8,
            min_partition_bits: 0,
            max_partition_bits: 24,
            max_partition_num: 64,
            max_bench_degree: 16,
            bench_edges_per_thread: 1 << 14,
            bench_internal_max_bits: 8,
            bench_min_samples: 1 << 14,
            bench_max_walkers: 1 << 12,
        }
    }
}

/// One group's chosen (or candidate) layout.
#[derive(Debug, Clone)]
pub struct GroupHint {
    pub vertex_begin: Vid,
    pub vertex_end: Vid,
    pub partition_bits: u32,
    pub partition_num: Vid,
    /// Estimated time for one step of every walker in the group.
    pub total_time: f64,
    pub step_time: f64,
}

/// The planner's output: the full grouping plus one sampler class per
/// partition, in partition order.
#[derive(Debug, Clone)]
pub struct GraphHint {
    pub group_bits: u32,
    pub group_num: Vid,
    pub group_hints: Vec<GroupHint>,
    pub partition_sampler_class: Vec<SamplerClass>,
}

/// Benchmark + MCKP: produce the layout hint for a loaded graph at walker
/// density `rho` (epoch walkers per edge).
pub fn partition_hint(
    rho: f64,
    loaded: &EdgeListGraph,
    cfg: &ThreadConfig,
    threads: &Threads,
    opts: &PlannerConfig,
) -> Result<GraphHint> {
    let mut group_bits = 0u32;
    while (loaded.v_num >> group_bits) > opts.max_group_num {
        group_bits += 1;
    }
    let group_num = loaded.v_num.div_ceil(1 << group_bits);

    let min_bits = opts.min_partition_bits.min(group_bits);
    let max_bits = opts.max_partition_bits.min(group_bits);
    let costs = mini_benchmark(rho, cfg, threads, opts, min_bits, max_bits)?;

    let hint = mckp(rho, min_bits, max_bits, &costs, loaded, group_bits, group_num, cfg, opts)?;
    info!(
        group_bits,
        group_num,
        partitions = hint.partition_sampler_class.len(),
        "planned partition layout"
    );
    Ok(hint)
}

#[derive(Clone, Copy)]
struct DpCell {
    val: f64,
    cand: usize,
    prev_p: usize,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn mckp(
    rho: f64,
    min_bits: u32,
    max_bits: u32,
    costs: &CostTable,
    loaded: &EdgeListGraph,
    group_bits: u32,
    group_num: Vid,
    cfg: &ThreadConfig,
    opts: &PlannerConfig,
) -> Result<GraphHint> {
    let v_num = loaded.v_num;
    let max_shuffle = cfg.threads as Vid;
    // A partition larger than this makes other threads wait on its holder.
    let thread_max_work = (loaded.e_num / cfg.threads as Eid / 8).max(1);

    let mut candidates: Vec<Vec<(GroupHint, Vec<SamplerClass>)>> =
        vec![Vec::new(); group_num as usize];
    for (g, group_candidates) in candidates.iter_mut().enumerate() {
        let g = g as Vid;
        let group_begin = g << group_bits;
        let group_end = (((g as u64 + 1) << group_bits).min(v_num as u64)) as Vid;

        for bits in min_bits..=max_bits {
            let Some(bits_costs) = costs.get(&bits) else { continue };
            if bits_costs.is_empty() {
                continue;
            }
            let psize = 1u32 << bits;
            let partition_num = (group_end - group_begin).div_ceil(psize);
            let mut classes = Vec::with_capacity(partition_num as usize);
            let mut total_time = 0.0f64;

            for p in 0..partition_num {
                let pbegin = group_begin + p * psize;
                let pend = group_end.min(pbegin + psize);

                // The first partitions get load-balance-shuffled, so cost
                // them on the shuffled range's average profile instead of
                // their pre-shuffle degree-sorted slice.
                let (edge_num, walker_num, avg_degree) = if g == 0 && p < max_shuffle {
                    let sbegin = 0;
                    let send = ((psize as u64 * max_shuffle as u64).min(group_end as u64)) as Vid;
                    let sedges = loaded.range_edges(sbegin, send);
                    let svertices = (send - sbegin) as f64;
                    let pvertices = (pend - pbegin) as f64;
                    (
                        (sedges as f64 / svertices * pvertices) as Eid,
                        sedges as f64 * rho / svertices * pvertices,
                        (sedges / (send - sbegin) as Eid).max(1) as Vid,
                    )
                } else {
                    let pedges = loaded.range_edges(pbegin, pend);
                    (
                        pedges,
                        pedges as f64 * rho,
                        (pedges / (pend - pbegin) as Eid).max(1) as Vid,
                    )
                };

                // Direct sampling beyond the measured degree range is
                // extrapolated with a proportional penalty.
                let (measured_degree, methods) = match bits_costs.range(avg_degree..).next() {
                    Some((&d, m)) => (d, m),
                    None => {
                        let (&d, m) = bits_costs.iter().next_back().expect("non-empty row");
                        (d, m)
                    }
                };
                let direct_penalty = if measured_degree < avg_degree {
                    avg_degree as f64 / measured_degree as f64
                } else {
                    1.0
                };
                let sync_penalty = if edge_num > thread_max_work {
                    edge_num as f64 / thread_max_work as f64
                } else {
                    1.0
                };

                let mut best: Option<(SamplerClass, f64)> = None;
                for &(class, step_time) in methods {
                    let mut val = step_time * walker_num;
                    if class != SamplerClass::ExclusiveBuffer {
                        val *= direct_penalty;
                    }
                    val *= sync_penalty;
                    if best.map_or(true, |(_, b)| val < b) {
                        best = Some((class, val));
                    }
                }
                let (class, val) = best.expect("non-empty method list");
                classes.push(class);
                total_time += val;
            }

            let group_walkers = loaded.range_edges(group_begin, group_end) as f64 * rho;
            group_candidates.push((
                GroupHint {
                    vertex_begin: group_begin,
                    vertex_end: group_end,
                    partition_bits: bits,
                    partition_num,
                    total_time,
                    step_time: if group_walkers > 0.0 { total_time / group_walkers } else { 0.0 },
                },
                classes,
            ));
        }
        if group_candidates.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no benchmark coverage for group {g}: walker density {rho:.3e} \
                 leaves every candidate partition without walkers"
            )));
        }
    }

    // f[g][p]: minimum estimated time for the first g groups using at most
    // p partitions.
    let p_cap = opts.max_partition_num;
    let groups = group_num as usize;
    let empty = DpCell { val: f64::INFINITY, cand: usize::MAX, prev_p: 0 };
    let mut f = vec![vec![empty; p_cap + 1]; groups + 1];
    for cell in &mut f[0] {
        cell.val = 0.0;
    }
    for g in 1..=groups {
        for (ci, (hint, _)) in candidates[g - 1].iter().enumerate() {
            let weight = hint.partition_num as usize;
            if weight > p_cap {
                continue;
            }
            for p in weight..=p_cap {
                let prev = f[g - 1][p - weight];
                if prev.val.is_finite() && prev.val + hint.total_time < f[g][p].val {
                    f[g][p] = DpCell {
                        val: prev.val + hint.total_time,
                        cand: ci,
                        prev_p: p - weight,
                    };
                }
            }
        }
        // Monotone fill: ties inherit the smaller-p state.
        for p in 1..=p_cap {
            if f[g][p - 1].val <= f[g][p].val {
                f[g][p] = f[g][p - 1];
            }
        }
    }

    if !f[groups][p_cap].val.is_finite() {
        return Err(Error::InvalidInput(format!(
            "no partitioning of {groups} groups fits within {p_cap} partitions"
        )));
    }

    let mut chosen = vec![usize::MAX; groups];
    let mut p = p_cap;
    for g in (1..=groups).rev() {
        let cell = f[g][p];
        chosen[g - 1] = cell.cand;
        p = cell.prev_p;
    }

    let mut group_hints = Vec::with_capacity(groups);
    let mut partition_sampler_class = Vec::new();
    for (g, &ci) in chosen.iter().enumerate() {
        let (hint, classes) = &candidates[g][ci];
        group_hints.push(hint.clone());
        partition_sampler_class.extend_from_slice(classes);
    }

    Ok(GraphHint { group_bits, group_num, group_hints, partition_sampler_class })
}

/// Largest walker batch whose state fits in `mem_quota` alongside the graph,
/// the exclusive-buffer rings, and `other_bytes` (Bloom filter).
///
/// Per-walker cost: the per-step columns and the output row (`2 × walk_len`)
/// plus current/next messages and the start vertex.
pub fn estimate_epoch_walkers(
    v_num: Vid,
    e_num: Eid,
    buffer_edges: Eid,
    walker_num: u64,
    walk_len: usize,
    sockets: usize,
    mem_quota: u64,
    other_bytes: u64,
) -> Result<Wid> {
    let graph_bytes = std::mem::size_of::<AdjList>() as u64 * v_num as u64 * sockets as u64
        + std::mem::size_of::<AdjUnit>() as u64 * e_num;
    let buffer_bytes = std::mem::size_of::<Vid>() as u64 * buffer_edges;
    let per_walker = std::mem::size_of::<Vid>() as u64 * (2 * walk_len as u64 + 3);
    let fixed = graph_bytes + buffer_bytes + other_bytes;

    let max_active = mem_quota.saturating_sub(fixed) / per_walker;
    if max_active == 0 {
        return Err(Error::OutOfMemory {
            requested: (fixed + per_walker) as usize,
        });
    }

    // Near-equal epochs: cap from memory, then even out the remainder.
    let cap = max_active.min(walker_num);
    let epochs = walker_num.div_ceil(cap);
    let per_epoch = walker_num.div_ceil(epochs);
    Ok(per_epoch.min((1u64 << 32) - 2) as Wid)
}

/// How many walkers to run in total.
#[derive(Debug, Clone, Copy)]
pub enum WalkerCount {
    Total(u64),
    /// `n` walkers per vertex (the `-e` epochs convention).
    PerVertex(u64),
}

impl WalkerCount {
    pub fn resolve(self, v_num: Vid) -> u64 {
        match self {
            WalkerCount::Total(n) => n,
            WalkerCount::PerVertex(n) => n * v_num as u64,
        }
    }
}

/// Load, plan, and build in one call; prepares the neighborhood query when
/// the graph will serve node2vec walks.
#[allow(clippy::too_many_arguments)]
pub fn make_graph(
    edges: Vec<Edge>,
    as_undirected: bool,
    walkers: WalkerCount,
    walk_len: usize,
    mem_quota: u64,
    is_node2vec: bool,
    cfg: &ThreadConfig,
    threads: &Threads,
    opts: &PlannerConfig,
) -> Result<Graph> {
    if walk_len == 0 {
        return Err(Error::InvalidInput("walk length must be at least 1".into()));
    }
    let loaded = EdgeListGraph::load(edges, as_undirected, threads)?;
    let total_walkers = walkers.resolve(loaded.v_num);
    if total_walkers == 0 {
        return Err(Error::InvalidInput("walker count must be positive".into()));
    }

    let bloom_bytes = if is_node2vec {
        let items = if as_undirected { loaded.e_num / 2 } else { loaded.e_num };
        BloomFilter::table_bytes(items)
    } else {
        0
    };
    // Buffer memory is bounded by one ring entry per edge.
    let epoch_walkers = estimate_epoch_walkers(
        loaded.v_num,
        loaded.e_num,
        loaded.e_num,
        total_walkers,
        walk_len,
        cfg.sockets,
        mem_quota,
        bloom_bytes,
    )?;
    let rho = epoch_walkers as f64 / loaded.e_num as f64;
    info!(total_walkers, epoch_walkers, rho = format_args!("{rho:.3}"), "walker density");

    let hint = partition_hint(rho, &loaded, cfg, threads, opts)?;
    let mut graph = loaded.build(&hint, cfg, threads)?;
    if is_node2vec {
        graph.prepare_neighbor_query(threads)?;
    }
    Ok(graph)
}
