//! The walk phase of one step: hand partitions to threads, drive the
//! partition's sampler over every thread's bucket, and (for node2vec)
//! run the rejection-acceptance loop.
//!
//! Per socket, partitions are handed out by fetch-add over the socket's
//! partition list. Half the threads (odd socket offset) take partitions
//! from the dense end of the list, the other half from the sparse end, so
//! cache-friendly and cache-hostile partitions drain concurrently instead
//! of serializing behind each other.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::graph::Graph;
use crate::message::MessageManager;
use crate::rng::{RngPool, WalkRng};
use crate::sampler::{EdgeSampler, Sampler, SamplerSet};
use crate::topo::{ThreadConfig, Threads};
use crate::types::Vid;
use crate::{Error, Result};

/// node2vec hyperparameters with the acceptance bounds precomputed.
#[derive(Debug, Clone, Copy)]
pub struct Node2VecParams {
    pub p: f32,
    pub q: f32,
    div_p: f32,
    div_q: f32,
    min_1_q: f32,
    /// `max(1, 1/p, 1/q)`: the proposal envelope for the rejection loop.
    pub upper: f32,
}

impl Node2VecParams {
    pub fn new(p: f32, q: f32) -> Result<Self> {
        if !(p > 0.0) || !(q > 0.0) {
            return Err(Error::InvalidInput(format!(
                "node2vec parameters must be positive, got p={p}, q={q}"
            )));
        }
        let div_p = 1.0 / p;
        let div_q = 1.0 / q;
        Ok(Self {
            p,
            q,
            div_p,
            div_q,
            min_1_q: div_q.min(1.0),
            upper: div_p.max(div_q).max(1.0),
        })
    }

    /// Accept or reject a candidate next vertex, `prob ∈ [0, upper]`.
    ///
    /// The neighborhood test only runs when the cheap bounds cannot decide:
    /// a return step compares against `1/p`, and any `prob` below
    /// `min(1, 1/q)` is accepted no matter the edge.
    #[inline]
    pub fn accept<F>(&self, prob: f32, prev: Vid, cand: Vid, has_neighbor: F) -> bool
    where
        F: FnOnce(Vid, Vid) -> bool,
    {
        if cand == prev {
            return prob <= self.div_p;
        }
        if prob <= self.min_1_q {
            return true;
        }
        let bound = if has_neighbor(prev, cand) { 1.0 } else { self.div_q };
        prob <= bound
    }
}

#[repr(align(64))]
struct PaddedCounter(AtomicUsize);

pub struct WalkEngine {
    cfg: ThreadConfig,
}

impl WalkEngine {
    pub fn new(cfg: ThreadConfig) -> Self {
        Self { cfg }
    }

    /// Advance every shuffled bucket by one sampled edge, in place.
    pub fn walk_step(
        &self,
        threads: &Threads,
        graph: &Graph,
        samplers: &SamplerSet,
        messages: &MessageManager,
        rngs: &RngPool,
        node2vec: Option<&Node2VecParams>,
    ) {
        let cfg = &self.cfg;
        let spt = cfg.socket_threads();
        let progress: Vec<PaddedCounter> =
            (0..cfg.sockets).map(|_| PaddedCounter(AtomicUsize::new(0))).collect();
        let dense_progress: Vec<PaddedCounter> =
            (0..cfg.sockets).map(|_| PaddedCounter(AtomicUsize::new(0))).collect();
        let sparse_progress: Vec<PaddedCounter> =
            (0..cfg.sockets).map(|_| PaddedCounter(AtomicUsize::new(0))).collect();

        threads.broadcast(|tid| {
            let socket = cfg.socket_of(tid);
            let dense_first = cfg.socket_offset(tid) % 2 == 1;
            let rng = unsafe { rngs.get_mut(tid) };
            let list = &graph.socket_partitions[socket];

            while progress[socket].0.fetch_add(1, Ordering::Relaxed) < list.len() {
                let p = if dense_first {
                    list[dense_progress[socket].0.fetch_add(1, Ordering::Relaxed)]
                } else {
                    list[list.len() - 1 - sparse_progress[socket].0.fetch_add(1, Ordering::Relaxed)]
                };
                // Progress counters guarantee each partition is handed to
                // exactly one thread, so its sampler is exclusively ours.
                let sampler = unsafe { samplers.partition_mut(p) };
                let partition_socket = graph.partition_socket[p];
                for s in 0..cfg.sockets {
                    for t in 0..spt {
                        let task = unsafe { messages.task(s * spt + t) };
                        let (begin, end) = task.bucket(p);
                        if begin == end {
                            continue;
                        }
                        let vertices = task.vertices();
                        let bucket =
                            unsafe { vertices.slice_mut(begin as usize, end as usize) };
                        match node2vec {
                            None => dispatch_static(sampler, bucket, rng),
                            Some(params) => {
                                let state_view = task.states();
                                let states = unsafe {
                                    state_view.slice(begin as usize, end as usize)
                                };
                                dispatch_node2vec(
                                    sampler,
                                    bucket,
                                    states,
                                    params,
                                    graph,
                                    partition_socket,
                                    rng,
                                );
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Match once per bucket, then run a monomorphized loop.
fn dispatch_static(sampler: &mut Sampler, bucket: &mut [Vid], rng: &mut WalkRng) {
    match sampler {
        Sampler::Direct(s) => static_bucket(s, bucket, rng),
        Sampler::UniformDegree(s) => static_bucket(s, bucket, rng),
        Sampler::SimilarDegree(s) => static_bucket(s, bucket, rng),
        Sampler::ExclusiveBuffer(s) => static_bucket(s, bucket, rng),
    }
}

fn static_bucket<S: EdgeSampler>(sampler: &mut S, bucket: &mut [Vid], rng: &mut WalkRng) {
    for message in bucket {
        *message = sampler.sample(*message, rng);
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch_node2vec(
    sampler: &mut Sampler,
    bucket: &mut [Vid],
    states: &[Vid],
    params: &Node2VecParams,
    graph: &Graph,
    socket: usize,
    rng: &mut WalkRng,
) {
    match sampler {
        Sampler::Direct(s) => node2vec_bucket(s, bucket, states, params, graph, socket, rng),
        Sampler::UniformDegree(s) => {
            node2vec_bucket(s, bucket, states, params, graph, socket, rng)
        }
        Sampler::SimilarDegree(s) => {
            node2vec_bucket(s, bucket, states, params, graph, socket, rng)
        }
        Sampler::ExclusiveBuffer(s) => {
            node2vec_bucket(s, bucket, states, params, graph, socket, rng)
        }
    }
}

fn node2vec_bucket<S: EdgeSampler>(
    sampler: &mut S,
    bucket: &mut [Vid],
    states: &[Vid],
    params: &Node2VecParams,
    graph: &Graph,
    socket: usize,
    rng: &mut WalkRng,
) {
    debug_assert_eq!(bucket.len(), states.len());
    for (message, &prev) in bucket.iter_mut().zip(states) {
        let current = *message;
        loop {
            let cand = sampler.sample(current, rng);
            let prob = rng.f32_below(params.upper);
            if params.accept(prob, prev, cand, |a, b| graph.has_neighbor(a, b, socket)) {
                *message = cand;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_precompute_bounds() {
        let p = Node2VecParams::new(0.5, 2.0).unwrap();
        assert!((p.upper - 2.0).abs() < 1e-6);
        assert!((p.min_1_q - 0.5).abs() < 1e-6);
    }

    #[test]
    fn params_reject_nonpositive() {
        assert!(Node2VecParams::new(0.0, 1.0).is_err());
        assert!(Node2VecParams::new(1.0, -2.0).is_err());
        assert!(Node2VecParams::new(f32::NAN, 1.0).is_err());
    }

    #[test]
    fn acceptance_matches_the_three_cases() {
        let params = Node2VecParams::new(0.5, 2.0).unwrap();
        // Return step: accepted iff prob <= 1/p = 2.0 (always, upper = 2).
        assert!(params.accept(1.9, 7, 7, |_, _| false));
        // Common neighbor: accepted iff prob <= 1.
        assert!(params.accept(0.9, 7, 8, |_, _| true));
        assert!(!params.accept(1.1, 7, 8, |_, _| true));
        // Out edge: accepted iff prob <= 1/q = 0.5.
        assert!(params.accept(0.4, 7, 8, |_, _| false));
        assert!(!params.accept(0.6, 7, 8, |_, _| false));
    }

    #[test]
    fn cheap_bound_skips_neighbor_test() {
        let params = Node2VecParams::new(1.0, 4.0).unwrap();
        // prob <= min(1, 1/q) = 0.25 accepts without touching the graph.
        let accepted = params.accept(0.2, 1, 2, |_, _| panic!("should not be called"));
        assert!(accepted);
    }
}
