//! Self-calibrating micro-benchmark: measure ns-per-sample for
//! (partition size, degree, sampler) combinations on synthetic graphs, and
//! cache the measurements per machine configuration.
//!
//! Only the two samplers whose relative order actually depends on the
//! machine are profiled: `UniformDegreeDirect` (the best-case direct read)
//! and `ExclusiveBuffer` (profitable only for degree > 4). The planner
//! treats the direct measurement as representative of all direct variants
//! and penalizes extrapolation beyond the measured degree range.
//!
//! Cache file: `<dir>/<⌊log₁.₅ ρ⌋>_<sockets>_<threads>.txt`, one
//! `"<partition_bits> <degree> <sampler_class> <step_time_ns>"` line per
//! measurement, sorted. A malformed line is reported and dropped; the
//! measurement regenerates on the next run.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{info, warn};

use crate::graph::{AdjList, AdjUnit};
use crate::mem::{MemoryPool, Placement};
use crate::plan::PlannerConfig;
use crate::rng::{RngPool, WalkRng};
use crate::sampler::{EdgeSampler, ExclusiveBufferSampler, UniformDegreeSampler};
use crate::topo::{ThreadConfig, Threads};
use crate::types::{SamplerClass, Vid};
use crate::{Error, Result};

/// partition_bits → degree → measured samplers with ns-per-step.
pub type CostTable = BTreeMap<u32, BTreeMap<Vid, Vec<(SamplerClass, f64)>>>;

pub fn cache_file_name(rho: f64, cfg: &ThreadConfig) -> String {
    let bucket = (rho.ln() / 1.5f64.ln()).floor();
    format!("{bucket:.0}_{}_{}.txt", cfg.sockets, cfg.threads)
}

pub struct BenchCache {
    file: PathBuf,
    items: BTreeMap<(u32, Vid, u8), f64>,
    new_items: usize,
}

impl BenchCache {
    pub fn open(dir: &Path, rho: f64, cfg: &ThreadConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = dir.join(cache_file_name(rho, cfg));
        let mut items = BTreeMap::new();
        if let Ok(contents) = fs::read_to_string(&file) {
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Ok((key, time)) => {
                        items.insert(key, time);
                    }
                    Err(e) => {
                        // Dropped entries simply re-run.
                        warn!(file = %file.display(), error = %e, "ignoring cache line");
                    }
                }
            }
        }
        info!(file = %file.display(), entries = items.len(), "benchmark cache");
        Ok(Self { file, items, new_items: 0 })
    }

    pub fn contains(&self, bits: u32, degree: Vid, class: SamplerClass) -> bool {
        self.items.contains_key(&(bits, degree, class.as_u8()))
    }

    pub fn insert(&mut self, bits: u32, degree: Vid, class: SamplerClass, step_time_ns: f64) {
        if self.items.insert((bits, degree, class.as_u8()), step_time_ns).is_none() {
            self.new_items += 1;
        }
    }

    pub fn save(&self) -> Result<()> {
        if self.new_items == 0 {
            return Ok(());
        }
        let mut out = fs::File::create(&self.file)?;
        for (&(bits, degree, class), &time) in &self.items {
            writeln!(out, "{bits} {degree} {class} {time}")?;
        }
        info!(file = %self.file.display(), new = self.new_items, "saved benchmark cache");
        Ok(())
    }

    /// Assemble the planner's cost table, extending measured rows past
    /// `internal_max` by copying the boundary row (cache behavior stops
    /// changing once the partition dwarfs the last-level cache).
    pub fn cost_table(&self, internal_max: u32, max_bits: u32) -> CostTable {
        let mut table: CostTable = BTreeMap::new();
        for (&(bits, degree, class), &time) in &self.items {
            if let Some(class) = SamplerClass::from_u8(class) {
                table.entry(bits).or_default().entry(degree).or_default().push((class, time));
            }
        }
        if let Some(boundary) = table.get(&internal_max).cloned() {
            for bits in internal_max + 1..=max_bits {
                table.insert(bits, boundary.clone());
            }
        }
        table
    }
}

fn parse_line(line: &str) -> Result<((u32, Vid, u8), f64)> {
    let corrupt = || Error::CorruptBenchmarkCache(line.to_string());
    let mut fields = line.split_whitespace();
    let bits: u32 = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
    let degree: Vid = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
    let class: u8 = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
    let time: f64 = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
    if fields.next().is_some() || SamplerClass::from_u8(class).is_none() || !time.is_finite() {
        return Err(corrupt());
    }
    Ok(((bits, degree, class), time))
}

#[derive(Clone, Copy)]
struct BenchTask {
    bits: u32,
    class: SamplerClass,
}

/// The sampling loop under test: masked to the synthetic partition, and
/// feeding each result back into the walker array like the real walk does.
fn walk_message_mock<S: EdgeSampler>(
    sampler: &mut S,
    messages: &mut [Vid],
    mask: Vid,
    rng: &mut WalkRng,
) {
    for m in messages {
        *m = sampler.sample(*m & mask, rng);
    }
}

/// Profile every uncached (partition_bits, degree, sampler) combination
/// and return the full cost table.
pub fn mini_benchmark(
    rho: f64,
    cfg: &ThreadConfig,
    threads: &Threads,
    opts: &PlannerConfig,
    min_bits: u32,
    max_bits: u32,
) -> Result<CostTable> {
    let internal_max = max_bits.min(opts.bench_internal_max_bits.max(min_bits));
    let mut cache = BenchCache::open(&opts.cache_dir, rho, cfg)?;

    let thread_edges = opts.bench_edges_per_thread;
    let max_vertices: Vid = 1 << internal_max;

    let mut test_degrees: Vec<Vid> = Vec::new();
    let mut d: Vid = 1;
    while d <= opts.max_bench_degree {
        test_degrees.push(d);
        d = (d + 1).max((d as f64 * 1.05) as Vid);
    }

    let mut tasks: BTreeMap<Vid, Vec<BenchTask>> = BTreeMap::new();
    for &degree in &test_degrees {
        for bits in min_bits..=internal_max {
            let vertices = 1u64 << bits;
            if vertices * degree as u64 > thread_edges {
                continue;
            }
            let walkers = (vertices as f64 * degree as f64 * rho) as u64;
            if walkers < 1 {
                continue;
            }
            if !cache.contains(bits, degree, SamplerClass::UniformDegreeDirect) {
                tasks.entry(degree).or_default().push(BenchTask {
                    bits,
                    class: SamplerClass::UniformDegreeDirect,
                });
            }
            if degree > 4 && !cache.contains(bits, degree, SamplerClass::ExclusiveBuffer) {
                tasks
                    .entry(degree)
                    .or_default()
                    .push(BenchTask { bits, class: SamplerClass::ExclusiveBuffer });
            }
        }
    }

    if !tasks.is_empty() {
        run_benchmarks(&tasks, &test_degrees, rho, cfg, threads, opts, &mut cache, max_vertices)?;
        cache.save()?;
    }

    Ok(cache.cost_table(internal_max, max_bits))
}

#[allow(clippy::too_many_arguments)]
fn run_benchmarks(
    tasks: &BTreeMap<Vid, Vec<BenchTask>>,
    test_degrees: &[Vid],
    rho: f64,
    cfg: &ThreadConfig,
    threads: &Threads,
    opts: &PlannerConfig,
    cache: &mut BenchCache,
    max_vertices: Vid,
) -> Result<()> {
    let started = Instant::now();
    let thread_edges = opts.bench_edges_per_thread as usize;
    let max_walkers = (((thread_edges as f64 * rho) as u64).clamp(1, opts.bench_max_walkers))
        as usize;
    let pool = MemoryPool::new(cfg.clone());

    let mut adjlists = Vec::with_capacity(cfg.threads);
    let mut adjunits = Vec::with_capacity(cfg.threads);
    let mut walkers = Vec::with_capacity(cfg.threads);
    for t in 0..cfg.threads {
        let socket = Placement::Node(cfg.socket_of(t));
        adjlists.push(pool.alloc::<AdjList>(max_vertices as usize, socket)?);
        adjunits.push(pool.alloc::<AdjUnit>(thread_edges, socket)?);
        walkers.push(pool.alloc::<Vid>(max_walkers, socket)?);
    }

    let rngs = RngPool::new(cfg.threads, rand::random());
    threads.broadcast(|tid| {
        let rng = unsafe { rngs.get_mut(tid) };
        for e in 0..thread_edges {
            unsafe {
                adjunits[tid].set(e, AdjUnit { neighbor: rng.u32_below(max_vertices) })
            };
        }
        for w in 0..max_walkers {
            unsafe { walkers[tid].set(w, rng.u32_below(max_vertices)) };
        }
    });

    let progress = AtomicUsize::new(0);
    let finished = AtomicUsize::new(0);
    let measured: Mutex<Vec<(u32, Vid, SamplerClass, f64)>> = Mutex::new(Vec::new());

    let outcomes = threads.broadcast(|tid| -> Result<()> {
        let socket = cfg.socket_of(tid);
        let rng = unsafe { rngs.get_mut(tid) };
        loop {
            let i = progress.fetch_add(1, Ordering::Relaxed);
            if i >= test_degrees.len() {
                break;
            }
            let degree = test_degrees[i];
            let Some(degree_tasks) = tasks.get(&degree) else { continue };

            // Carve the shared neighbor array into `degree`-wide spans.
            let usable = (thread_edges / degree as usize).min(max_vertices as usize) as Vid;
            for v in 0..usable {
                let begin = unsafe { adjunits[tid].as_ptr().add((v * degree) as usize) };
                unsafe { adjlists[tid].set(v as usize, AdjList { degree, begin }) };
            }

            let local_pool = MemoryPool::new(cfg.clone());
            for task in degree_tasks {
                let vertices: Vid = 1 << task.bits;
                let mask = vertices - 1;
                let walker_num =
                    ((vertices as f64 * degree as f64 * rho) as usize).clamp(1, max_walkers);
                let span = unsafe { walkers[tid].slice_mut(0, walker_num) };

                let ns = match task.class {
                    SamplerClass::UniformDegreeDirect => {
                        let mut sampler = UniformDegreeSampler::new(0, vertices, adjlists[tid]);
                        let iters =
                            (opts.bench_min_samples / walker_num as u64).max(4) as usize;
                        let mut work = 0u64;
                        let mut elapsed = 0.0f64;
                        for _ in 0..iters {
                            sampler.reset(0, vertices, adjlists[tid]);
                            let t0 = Instant::now();
                            walk_message_mock(&mut sampler, span, mask, rng);
                            elapsed += t0.elapsed().as_secs_f64();
                            work += walker_num as u64;
                        }
                        elapsed / work as f64 * 1e9
                    }
                    SamplerClass::ExclusiveBuffer => {
                        let mut sampler = ExclusiveBufferSampler::new(
                            0,
                            vertices,
                            adjlists[tid],
                            &local_pool,
                            socket,
                        )?;
                        let iters = (opts
                            .bench_min_samples
                            .max(4 * sampler.buffer_unit_num)
                            / walker_num as u64)
                            .max(4) as usize;
                        let mut work = 0u64;
                        let mut elapsed = 0.0f64;
                        for _ in 0..iters {
                            sampler.reset(0, vertices, adjlists[tid]);
                            let t0 = Instant::now();
                            walk_message_mock(&mut sampler, span, mask, rng);
                            elapsed += t0.elapsed().as_secs_f64();
                            work += walker_num as u64;
                        }
                        elapsed / work as f64 * 1e9
                    }
                    _ => continue,
                };
                measured
                    .lock()
                    .expect("benchmark results mutex poisoned")
                    .push((task.bits, degree, task.class, ns));
            }
        }

        // Keep this core busy until every thread is done, so late finishers
        // are not measured against an idle machine.
        finished.fetch_add(1, Ordering::Release);
        let mut keep_hot = 0u64;
        while finished.load(Ordering::Acquire) < cfg.threads {
            for _ in 0..1024 {
                let e = rng.u32_below(thread_edges as u32) as usize;
                keep_hot =
                    keep_hot.wrapping_add(unsafe { adjunits[tid].get(e) }.neighbor as u64);
            }
            std::hint::black_box(keep_hot);
        }
        Ok(())
    });
    for outcome in outcomes {
        outcome?;
    }

    let results = measured.into_inner().expect("benchmark results mutex poisoned");
    let count = results.len();
    for (bits, degree, class, ns) in results {
        cache.insert(bits, degree, class, ns);
    }
    info!(
        new_measurements = count,
        seconds = format_args!("{:.2}", started.elapsed().as_secs_f64()),
        "micro-benchmark"
    );
    Ok(())
}
