//! Edge samplers: four implementations of `sample(vertex, rng) -> vertex`,
//! one instance per partition.
//!
//! The variants cover distinct performance regimes:
//!
//! - [`DirectSampler`] reads the adjacency metadata then one random
//!   neighbor. Baseline.
//! - [`UniformDegreeSampler`] drops the metadata read: when every vertex in
//!   the partition has the same degree, the neighbor address is arithmetic
//!   on the vertex id.
//! - [`SimilarDegreeSampler`] keeps up to eight `(vertex_end, degree, base)`
//!   hints and finds the right one with a short linear scan. Worthwhile only
//!   when the partition is too big for L2.
//! - [`ExclusiveBufferSampler`] pre-draws neighbors into a per-vertex ring
//!   so the hot loop reads sequentially; the ring is refilled in bulk when
//!   it runs dry. Wins on high-degree partitions where random access to the
//!   true adjacency would miss cache on every step.
//!
//! Dispatch is a closed enum matched once per (partition, bucket); the inner
//! loops are monomorphized over the concrete sampler type.

use rayon::prelude::*;

use crate::graph::{AdjList, AdjUnit, Graph};
use crate::mem::{MemoryCounter, MemoryPool, Placement, SharedSlice, SyncCell, CACHE_LINE};
use crate::rng::WalkRng;
use crate::topo::Threads;
use crate::types::{SamplerClass, Vid};
use crate::Result;

/// Most distinct degree values [`SimilarDegreeSampler`] will track.
pub const SIMILAR_DEGREE_MAX_HINTS: usize = 8;

pub trait EdgeSampler {
    fn sample(&mut self, vertex: Vid, rng: &mut WalkRng) -> Vid;
}

/// Ring length for one vertex's pre-sampled neighbors: at least 8, and
/// never a power of two above 8 (cache-set conflicts across vertices).
pub fn edge_buffer_len(degree: Vid) -> Vid {
    let mut len = degree.max(8);
    if len > 8 && len.is_power_of_two() {
        len += 1;
    }
    len
}

pub struct DirectSampler {
    adjlists: SharedSlice<AdjList>,
}

impl DirectSampler {
    pub fn new(adjlists: SharedSlice<AdjList>) -> Self {
        Self { adjlists }
    }
}

impl EdgeSampler for DirectSampler {
    #[inline]
    fn sample(&mut self, vertex: Vid, rng: &mut WalkRng) -> Vid {
        let a = unsafe { self.adjlists.get(vertex as usize) };
        unsafe { (*a.begin.add(rng.u32_below(a.degree) as usize)).neighbor }
    }
}

pub struct UniformDegreeSampler {
    vertex_begin: Vid,
    degree: Vid,
    edge_begin: *const AdjUnit,
}

impl UniformDegreeSampler {
    /// Precondition: all vertices in `[vertex_begin, vertex_end)` share one
    /// degree and their edges are laid out contiguously from `vertex_begin`.
    pub fn new(vertex_begin: Vid, vertex_end: Vid, adjlists: SharedSlice<AdjList>) -> Self {
        let first = unsafe { adjlists.get(vertex_begin as usize) };
        debug_assert!({
            let last = unsafe { adjlists.get(vertex_end as usize - 1) };
            first.degree == last.degree
        });
        Self { vertex_begin, degree: first.degree, edge_begin: first.begin }
    }

    /// Benchmark-only: evict the partition's edges and rebind.
    pub fn reset(&mut self, vertex_begin: Vid, vertex_end: Vid, adjlists: SharedSlice<AdjList>) {
        let span = self.degree as usize * (vertex_end - vertex_begin) as usize;
        flush_span(self.edge_begin, span);
        *self = Self::new(vertex_begin, vertex_end, adjlists);
    }
}

impl EdgeSampler for UniformDegreeSampler {
    #[inline]
    fn sample(&mut self, vertex: Vid, rng: &mut WalkRng) -> Vid {
        let idx =
            (vertex - self.vertex_begin) as usize * self.degree as usize
                + rng.u32_below(self.degree) as usize;
        unsafe { (*self.edge_begin.add(idx)).neighbor }
    }
}

#[derive(Clone, Copy)]
struct AdjHint {
    vertex_begin: Vid,
    vertex_end: Vid,
    degree: Vid,
    edge_begin: *const AdjUnit,
}

const EMPTY_HINT: AdjHint =
    AdjHint { vertex_begin: 0, vertex_end: 0, degree: 0, edge_begin: std::ptr::null() };

pub struct SimilarDegreeSampler {
    hint_num: usize,
    hints: [AdjHint; SIMILAR_DEGREE_MAX_HINTS],
}

impl SimilarDegreeSampler {
    /// Suitable iff the partition's degree spread fits in the hint table and
    /// the partition does not fit in L2 (otherwise direct reads are cheap
    /// anyway). Vertices must be degree-monotone within the partition.
    pub fn valid(graph: &Graph, p: usize, l2_cache: usize) -> bool {
        let spread =
            graph.partition_max_degree[p] as usize - graph.partition_min_degree[p] as usize + 1;
        if spread > SIMILAR_DEGREE_MAX_HINTS {
            return false;
        }
        let vertices = (graph.partition_end[p] - graph.partition_begin[p]) as usize;
        let bytes = graph.partition_edge_num[p] as usize * std::mem::size_of::<AdjUnit>()
            + vertices * std::mem::size_of::<AdjList>();
        bytes >= l2_cache
    }

    pub fn new(vertex_begin: Vid, vertex_end: Vid, adjlists: SharedSlice<AdjList>) -> Self {
        let mut hints = [EMPTY_HINT; SIMILAR_DEGREE_MAX_HINTS];
        let mut hint_num = 0usize;
        let mut current_degree = Vid::MAX;
        for v in vertex_begin..vertex_end {
            let a = unsafe { adjlists.get(v as usize) };
            if a.degree != current_degree {
                current_degree = a.degree;
                if hint_num != 0 {
                    hints[hint_num - 1].vertex_end = v;
                }
                hints[hint_num] =
                    AdjHint { vertex_begin: v, vertex_end, degree: a.degree, edge_begin: a.begin };
                hint_num += 1;
            }
        }
        hints[hint_num - 1].vertex_end = vertex_end;
        Self { hint_num, hints }
    }
}

impl EdgeSampler for SimilarDegreeSampler {
    #[inline]
    fn sample(&mut self, vertex: Vid, rng: &mut WalkRng) -> Vid {
        for hint in &self.hints[..self.hint_num] {
            if vertex < hint.vertex_end {
                let idx = (vertex - hint.vertex_begin) as usize * hint.degree as usize
                    + rng.u32_below(hint.degree) as usize;
                return unsafe { (*hint.edge_begin.add(idx)).neighbor };
            }
        }
        debug_assert!(false, "vertex outside sampler range");
        0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferHeader {
    head: u32,
    end: u32,
}

pub struct ExclusiveBufferSampler {
    vertex_begin: Vid,
    vertex_end: Vid,
    adjlists: SharedSlice<AdjList>,
    headers: SharedSlice<BufferHeader>,
    units: SharedSlice<Vid>,
    pub buffer_unit_num: u64,
}

impl ExclusiveBufferSampler {
    pub fn new(
        vertex_begin: Vid,
        vertex_end: Vid,
        adjlists: SharedSlice<AdjList>,
        pool: &MemoryPool,
        socket: usize,
    ) -> Result<Self> {
        let n = (vertex_end - vertex_begin) as usize;
        let mut total: u64 = 0;
        for v in vertex_begin..vertex_end {
            let a = unsafe { adjlists.get(v as usize) };
            total += edge_buffer_len(a.degree) as u64;
        }
        debug_assert!(total <= u32::MAX as u64, "edge buffer exceeds u32 offsets");

        let mut counter = MemoryCounter::new();
        counter.add::<BufferHeader>(n);
        counter.add::<Vid>(total as usize);
        let mut arena = pool.arena(&counter, Placement::Node(socket))?;
        let headers = arena.take::<BufferHeader>(n);
        let units = arena.take::<Vid>(total as usize);

        let mut cursor = 0u32;
        for (i, v) in (vertex_begin..vertex_end).enumerate() {
            let a = unsafe { adjlists.get(v as usize) };
            cursor += edge_buffer_len(a.degree);
            // head == end forces a refill on the first draw.
            unsafe { headers.set(i, BufferHeader { head: cursor, end: cursor }) };
        }

        Ok(Self { vertex_begin, vertex_end, adjlists, headers, units, buffer_unit_num: total })
    }

    /// Invalidate all rings so the next epoch re-draws them.
    pub fn clear(&mut self) {
        for i in 0..(self.vertex_end - self.vertex_begin) as usize {
            let h = unsafe { self.headers.at_mut(i) };
            h.head = h.end;
        }
    }

    #[cold]
    fn refill(&mut self, vertex: Vid, rng: &mut WalkRng) -> u32 {
        let a = unsafe { self.adjlists.get(vertex as usize) };
        let len = edge_buffer_len(a.degree);
        let idx = (vertex - self.vertex_begin) as usize;
        let end = unsafe { self.headers.get(idx) }.end;
        let start = end - len;
        for i in 0..len {
            let neighbor =
                unsafe { (*a.begin.add(rng.u32_below(a.degree) as usize)).neighbor };
            unsafe { self.units.set((start + i) as usize, neighbor) };
        }
        // The true adjacency was only needed for the refill; evict it so it
        // does not crowd the rings out of cache.
        flush_span(a.begin, a.degree as usize);
        unsafe { self.headers.at_mut(idx) }.head = start;
        start
    }

    /// Benchmark-only: evict rings, headers, and adjacency, then rebind.
    pub fn reset(&mut self, vertex_begin: Vid, vertex_end: Vid, adjlists: SharedSlice<AdjList>) {
        flush_span(self.units.as_ptr(), self.buffer_unit_num as usize);
        flush_span(self.headers.as_ptr(), (self.vertex_end - self.vertex_begin) as usize);
        for v in self.vertex_begin..self.vertex_end {
            let a = unsafe { self.adjlists.get(v as usize) };
            flush_span(a.begin, a.degree as usize);
        }
        flush_span(
            unsafe { self.adjlists.as_ptr().add(self.vertex_begin as usize) },
            (self.vertex_end - self.vertex_begin) as usize,
        );
        self.vertex_begin = vertex_begin;
        self.vertex_end = vertex_end;
        self.adjlists = adjlists;
    }
}

impl EdgeSampler for ExclusiveBufferSampler {
    #[inline]
    fn sample(&mut self, vertex: Vid, rng: &mut WalkRng) -> Vid {
        let idx = (vertex - self.vertex_begin) as usize;
        let h = unsafe { self.headers.get(idx) };
        let slot = if h.head == h.end { self.refill(vertex, rng) } else { h.head };
        unsafe { self.headers.at_mut(idx) }.head = slot + 1;
        let out = unsafe { self.units.get(slot as usize) };
        if (slot & 15) == 15 {
            prefetch(unsafe { self.units.as_ptr().add(slot as usize + 1) });
        }
        out
    }
}

/// The per-partition sampler, dispatched once per bucket.
pub enum Sampler {
    Direct(DirectSampler),
    UniformDegree(UniformDegreeSampler),
    SimilarDegree(SimilarDegreeSampler),
    ExclusiveBuffer(ExclusiveBufferSampler),
}

impl Sampler {
    pub fn class(&self) -> SamplerClass {
        match self {
            Sampler::Direct(_) => SamplerClass::Direct,
            Sampler::UniformDegree(_) => SamplerClass::UniformDegreeDirect,
            Sampler::SimilarDegree(_) => SamplerClass::SimilarDegreeDirect,
            Sampler::ExclusiveBuffer(_) => SamplerClass::ExclusiveBuffer,
        }
    }
}

// Safety: samplers hold raw pointers into graph arenas (shared, immutable)
// and into their own exclusive ring buffers; the scheduler hands each
// partition's sampler to one thread at a time.
unsafe impl Send for Sampler {}

/// One sampler per partition, chosen from the planner's class hint and the
/// partition's degree profile.
pub struct SamplerSet {
    #[allow(dead_code)]
    pool: MemoryPool,
    samplers: Vec<SyncCell<Sampler>>,
    pub edge_buffer_units: u64,
}

impl SamplerSet {
    pub fn build(graph: &Graph, threads: &Threads) -> Result<Self> {
        let cfg = graph.config().clone();
        let l2_cache = cfg.l2_cache;
        let pool = MemoryPool::new(cfg);
        let built: Vec<Sampler> = threads.install(|| {
            (0..graph.partition_num)
                .into_par_iter()
                .map(|p| -> Result<Sampler> {
                    let socket = graph.partition_socket[p];
                    let adjlists = graph.adjlists_on(socket);
                    let (begin, end) = (graph.partition_begin[p], graph.partition_end[p]);
                    Ok(match graph.partition_sampler_class[p] {
                        SamplerClass::ExclusiveBuffer => Sampler::ExclusiveBuffer(
                            ExclusiveBufferSampler::new(begin, end, adjlists, &pool, socket)?,
                        ),
                        _ if graph.partition_min_degree[p] == graph.partition_max_degree[p] => {
                            Sampler::UniformDegree(UniformDegreeSampler::new(begin, end, adjlists))
                        }
                        _ if SimilarDegreeSampler::valid(graph, p, l2_cache) => {
                            Sampler::SimilarDegree(SimilarDegreeSampler::new(begin, end, adjlists))
                        }
                        _ => Sampler::Direct(DirectSampler::new(adjlists)),
                    })
                })
                .collect::<Result<Vec<_>>>()
        })?;
        let edge_buffer_units = built
            .iter()
            .map(|s| match s {
                Sampler::ExclusiveBuffer(b) => b.buffer_unit_num,
                _ => 0,
            })
            .sum();
        let samplers = built.into_iter().map(SyncCell::new).collect();
        Ok(Self { pool, samplers, edge_buffer_units })
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// # Safety
    /// The caller must hold partition `p` exclusively (the walk scheduler's
    /// progress counters guarantee a partition is processed by one thread at
    /// a time).
    #[inline]
    pub unsafe fn partition_mut(&self, p: usize) -> &mut Sampler {
        self.samplers[p].get_mut()
    }

    /// Invalidate all exclusive-buffer rings at an epoch boundary.
    pub fn clear(&self, threads: &Threads) {
        threads.install(|| {
            self.samplers.par_iter().for_each(|cell| {
                if let Sampler::ExclusiveBuffer(b) = unsafe { cell.get_mut() } {
                    b.clear();
                }
            });
        });
    }
}

#[cfg(target_arch = "x86_64")]
fn flush_span<T>(ptr: *const T, count: usize) {
    if ptr.is_null() {
        return;
    }
    let bytes = count * std::mem::size_of::<T>();
    let base = ptr as *const u8;
    let mut off = 0usize;
    while off < bytes {
        unsafe { core::arch::x86_64::_mm_clflush(base.add(off)) };
        off += CACHE_LINE;
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn flush_span<T>(_ptr: *const T, _count: usize) {}

#[cfg(target_arch = "x86_64")]
#[inline]
fn prefetch<T>(ptr: *const T) {
    unsafe {
        core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T1 }>(ptr as *const i8)
    };
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn prefetch<T>(_ptr: *const T) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_floors_at_eight() {
        assert_eq!(edge_buffer_len(1), 8);
        assert_eq!(edge_buffer_len(8), 8);
    }

    #[test]
    fn buffer_len_avoids_powers_of_two() {
        assert_eq!(edge_buffer_len(16), 17);
        assert_eq!(edge_buffer_len(1024), 1025);
        assert_eq!(edge_buffer_len(17), 17);
        assert_eq!(edge_buffer_len(1000), 1000);
    }

    mod synthetic {
        use super::super::*;
        use crate::mem::MemoryPool;
        use crate::topo::{MachineInfo, ThreadConfig};

        /// A tiny synthetic partition: `n` vertices of equal `degree`, with
        /// neighbor values `v * degree + e`.
        fn synth(
            pool: &MemoryPool,
            n: Vid,
            degree: Vid,
        ) -> (SharedSlice<AdjList>, SharedSlice<AdjUnit>) {
            let adjlists = pool.alloc::<AdjList>(n as usize, Placement::Ignore).unwrap();
            let units = pool
                .alloc::<AdjUnit>((n * degree) as usize, Placement::Ignore)
                .unwrap();
            for v in 0..n {
                for e in 0..degree {
                    unsafe {
                        units.set((v * degree + e) as usize, AdjUnit { neighbor: v * degree + e })
                    };
                }
                let begin = unsafe { units.as_ptr().add((v * degree) as usize) };
                unsafe { adjlists.set(v as usize, AdjList { degree, begin }) };
            }
            (adjlists, units)
        }

        fn pool() -> MemoryPool {
            let machine =
                MachineInfo { cores: 2, sockets: 1, l2_cache: 1 << 20, total_ram: 1 << 33 };
            MemoryPool::new(ThreadConfig::new(1, 1, &machine).unwrap())
        }

        #[test]
        fn direct_draws_only_own_neighbors() {
            let pool = pool();
            let (adjlists, _units) = synth(&pool, 8, 5);
            let mut s = DirectSampler::new(adjlists);
            let mut rng = WalkRng::new(3);
            for v in 0..8u32 {
                for _ in 0..64 {
                    let n = s.sample(v, &mut rng);
                    assert!(n >= v * 5 && n < (v + 1) * 5, "vertex {v} drew {n}");
                }
            }
        }

        #[test]
        fn uniform_degree_matches_direct_address_math() {
            let pool = pool();
            let (adjlists, _units) = synth(&pool, 16, 3);
            let mut s = UniformDegreeSampler::new(0, 16, adjlists);
            let mut rng = WalkRng::new(9);
            for v in 0..16u32 {
                for _ in 0..32 {
                    let n = s.sample(v, &mut rng);
                    assert!(n >= v * 3 && n < (v + 1) * 3);
                }
            }
        }

        #[test]
        fn similar_degree_tracks_degree_steps() {
            let pool = pool();
            // 6 vertices: degrees 4,4,3,3,2,2 laid out contiguously.
            let degrees = [4u32, 4, 3, 3, 2, 2];
            let total: u32 = degrees.iter().sum();
            let adjlists = pool.alloc::<AdjList>(6, Placement::Ignore).unwrap();
            let units = pool.alloc::<AdjUnit>(total as usize, Placement::Ignore).unwrap();
            let mut off = 0u32;
            let mut spans = Vec::new();
            for (v, &d) in degrees.iter().enumerate() {
                for e in 0..d {
                    unsafe { units.set((off + e) as usize, AdjUnit { neighbor: off + e }) };
                }
                let begin = unsafe { units.as_ptr().add(off as usize) };
                unsafe { adjlists.set(v, AdjList { degree: d, begin }) };
                spans.push((off, off + d));
                off += d;
            }
            let mut s = SimilarDegreeSampler::new(0, 6, adjlists);
            let mut rng = WalkRng::new(21);
            for v in 0..6u32 {
                let (lo, hi) = spans[v as usize];
                for _ in 0..64 {
                    let n = s.sample(v, &mut rng);
                    assert!(n >= lo && n < hi, "vertex {v} drew {n}, span [{lo},{hi})");
                }
            }
        }

        #[test]
        fn exclusive_buffer_draws_only_own_neighbors() {
            let pool = pool();
            let (adjlists, _units) = synth(&pool, 4, 6);
            let mut s = ExclusiveBufferSampler::new(0, 4, adjlists, &pool, 0).unwrap();
            let mut rng = WalkRng::new(17);
            // Draw far past the ring length to exercise refills.
            for _ in 0..5 {
                for v in 0..4u32 {
                    for _ in 0..32 {
                        let n = s.sample(v, &mut rng);
                        assert!(n >= v * 6 && n < (v + 1) * 6, "vertex {v} drew {n}");
                    }
                }
            }
        }

        #[test]
        fn exclusive_buffer_ring_sizes_accumulate() {
            let pool = pool();
            let (adjlists, _units) = synth(&pool, 3, 10);
            let s = ExclusiveBufferSampler::new(0, 3, adjlists, &pool, 0).unwrap();
            assert_eq!(s.buffer_unit_num, 3 * edge_buffer_len(10) as u64);
        }

        #[test]
        fn exclusive_buffer_clear_forces_refill() {
            let pool = pool();
            let (adjlists, _units) = synth(&pool, 2, 9);
            let mut s = ExclusiveBufferSampler::new(0, 2, adjlists, &pool, 0).unwrap();
            let mut rng = WalkRng::new(2);
            let _ = s.sample(0, &mut rng);
            s.clear();
            let n = s.sample(0, &mut rng);
            assert!(n < 9);
        }
    }
}
