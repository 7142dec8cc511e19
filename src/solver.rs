//! The walk orchestrator: epoch sizing, the lock-step per-step loop, and
//! the final transpose into walker-major output.
//!
//! Walkers run in epochs no larger than the batch that fits in the memory
//! quota. Within an epoch every walker advances one edge per step:
//! shuffle (group walkers by current partition) → walk (sample per bucket)
//! → update (scatter results back to walker order). After the last step the
//! per-step columns are transposed into one path row per walker.

use std::time::Instant;

use tracing::info;

use crate::graph::Graph;
use crate::mem::SharedSlice;
use crate::message::MessageManager;
use crate::plan::estimate_epoch_walkers;
use crate::profiler::{Phase, Profiler};
use crate::rng::RngPool;
use crate::sampler::SamplerSet;
use crate::topo::{ThreadConfig, Threads};
use crate::types::{SamplerClass, Vid, Wid};
use crate::walk::{Node2VecParams, WalkEngine};
use crate::walker::WalkerManager;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub walker_num: u64,
    pub walk_len: usize,
    pub mem_quota: u64,
    /// `Some((p, q))` switches steps 2.. to node2vec acceptance.
    pub node2vec: Option<(f32, f32)>,
    /// Seed for the per-thread generator streams.
    pub seed: u64,
}

pub struct Solver<'g> {
    cfg: ThreadConfig,
    graph: &'g Graph,
    threads: &'g Threads,
    rngs: RngPool,
    samplers: SamplerSet,
    walkers: WalkerManager,
    messages: MessageManager,
    engine: WalkEngine,
    node2vec: Option<Node2VecParams>,
    pub profiler: Profiler,
    walk_len: usize,
    max_epoch_walkers: Wid,
    remaining: u64,
    terminated: u64,
    /// One column per step, indexed by walker id.
    walks: Vec<SharedSlice<Vid>>,
    start_vertices: SharedSlice<Vid>,
}

impl<'g> Solver<'g> {
    pub fn new(graph: &'g Graph, threads: &'g Threads, opts: SolverOptions) -> Result<Self> {
        if opts.walk_len == 0 {
            return Err(Error::InvalidInput("walk length must be at least 1".into()));
        }
        if opts.walker_num == 0 {
            return Err(Error::InvalidInput("walker count must be positive".into()));
        }
        let node2vec = match opts.node2vec {
            Some((p, q)) => {
                if !graph.has_neighbor_index() {
                    return Err(Error::InvalidInput(
                        "node2vec walks need a graph built with the neighborhood query \
                         prepared"
                            .into(),
                    ));
                }
                Some(Node2VecParams::new(p, q)?)
            }
            None => None,
        };
        let cfg = graph.config().clone();

        // Exclusive-buffer rings are the only sampler state that scales
        // with the graph; count it before sizing the epoch.
        let buffer_edges: u64 = (0..graph.partition_num)
            .filter(|&p| graph.partition_sampler_class[p] == SamplerClass::ExclusiveBuffer)
            .map(|p| graph.partition_edge_num[p])
            .sum();
        let max_epoch_walkers = estimate_epoch_walkers(
            graph.v_num,
            graph.e_num,
            buffer_edges,
            opts.walker_num,
            opts.walk_len,
            cfg.sockets,
            opts.mem_quota,
            graph.bloom_size_bytes(),
        )?;
        info!(
            total = opts.walker_num,
            per_epoch = max_epoch_walkers,
            epochs = opts.walker_num.div_ceil(max_epoch_walkers as u64),
            "epoch plan"
        );

        let samplers = SamplerSet::build(graph, threads)?;
        let walkers = WalkerManager::new(&cfg, max_epoch_walkers)?;
        let messages = MessageManager::new(graph, &walkers, node2vec.is_some())?;
        let walks = (0..opts.walk_len)
            .map(|_| walkers.alloc_array::<Vid>(1))
            .collect::<Result<Vec<_>>>()?;
        let start_vertices = walkers.alloc_array::<Vid>(1)?;
        let rngs = RngPool::new(cfg.threads, opts.seed);
        let engine = WalkEngine::new(cfg.clone());

        Ok(Self {
            cfg,
            graph,
            threads,
            rngs,
            samplers,
            walkers,
            messages,
            engine,
            node2vec,
            profiler: Profiler::new(),
            walk_len: opts.walk_len,
            max_epoch_walkers,
            remaining: opts.walker_num,
            terminated: 0,
            walks,
            start_vertices,
        })
    }

    pub fn has_next_epoch(&self) -> bool {
        self.remaining != 0
    }

    pub fn walk_len(&self) -> usize {
        self.walk_len
    }

    pub fn max_epoch_walkers(&self) -> Wid {
        self.max_epoch_walkers
    }

    pub fn terminated_walkers(&self) -> u64 {
        self.terminated
    }

    /// An output slab big enough for one epoch, walker-major.
    pub fn alloc_output(&self) -> Result<SharedSlice<Vid>> {
        self.walkers.alloc_array::<Vid>(self.walk_len)
    }

    /// Run one epoch; `output[w * walk_len + step]` receives the paths for
    /// this epoch's walkers. Returns the number of walkers completed.
    pub fn walk_epoch(&mut self, output: SharedSlice<Vid>) -> Wid {
        let epoch_walkers = self.max_epoch_walkers.min(self.remaining.min(u64::from(Wid::MAX)) as Wid);
        let walk_len = self.walk_len;
        let v_num = self.graph.v_num;
        debug_assert!(output.len() >= epoch_walkers as usize * walk_len);

        let timer = Instant::now();
        self.samplers.clear(self.threads);

        // Start vertices straight into the first column.
        let start_vertices = self.start_vertices;
        let first = self.walks[0];
        let rngs = &self.rngs;
        self.walkers.process_walkers(self.threads, epoch_walkers, |tid, w| {
            let v = unsafe { rngs.get_mut(tid) }.u32_below(v_num);
            unsafe { start_vertices.set(w as usize, v) };
            unsafe { first.set(w as usize, v) };
        });
        self.profiler.record(Phase::Init, timer.elapsed());

        let mut current = self.walks[0];
        let mut previous: Option<SharedSlice<Vid>> = None;
        for step in 1..walk_len {
            // The first advance of a node2vec walk has no previous vertex
            // and is a plain uniform step.
            let node2vec_step =
                if step > 1 { self.node2vec.as_ref() } else { None };
            self.profiler.count_step();

            let t0 = Instant::now();
            let states = node2vec_step.and(previous);
            self.messages.shuffle(self.threads, self.graph, current, states, epoch_walkers);
            self.profiler.record(Phase::Shuffle, t0.elapsed());

            let t0 = Instant::now();
            self.engine.walk_step(
                self.threads,
                self.graph,
                &self.samplers,
                &self.messages,
                &self.rngs,
                node2vec_step,
            );
            self.profiler.record(Phase::Walk, t0.elapsed());

            let t0 = Instant::now();
            let next = self.walks[step];
            self.messages.update(self.threads, next);
            self.profiler.record(Phase::Update, t0.elapsed());

            previous = Some(current);
            current = next;
        }

        // Transpose the per-step columns into per-walker rows.
        let t0 = Instant::now();
        let walks = &self.walks;
        self.walkers.process_walkers(self.threads, epoch_walkers, |_tid, w| {
            for (step, column) in walks.iter().enumerate() {
                unsafe {
                    output.set(w as usize * walk_len + step, column.get(w as usize));
                }
            }
        });
        self.profiler.record(Phase::Transpose, t0.elapsed());

        self.remaining -= epoch_walkers as u64;
        self.terminated += epoch_walkers as u64;
        info!(
            epoch_walkers,
            remaining = self.remaining,
            seconds = format_args!("{:.3}", timer.elapsed().as_secs_f64()),
            "epoch complete"
        );
        epoch_walkers
    }

    /// Drive every epoch and collect all paths into one walker-major vec.
    /// Convenience for consumers that can hold the full output in memory.
    pub fn run_to_vec(&mut self) -> Result<Vec<Vid>> {
        let walk_len = self.walk_len;
        let total = self.remaining + self.terminated;
        let mut all = Vec::with_capacity(total as usize * walk_len);
        let output = self.alloc_output()?;
        while self.has_next_epoch() {
            let done = self.walk_epoch(output);
            let slab = unsafe { output.slice(0, done as usize * walk_len) };
            all.extend_from_slice(slab);
        }
        self.report();
        Ok(all)
    }

    /// Log phase timings normalized per walker step.
    pub fn report(&self) {
        let steps = self.terminated * self.walk_len.saturating_sub(1) as u64;
        self.profiler.report(steps.max(1), self.cfg.threads);
    }
}
