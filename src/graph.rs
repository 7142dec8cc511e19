//! The graph store: degree-sorted, partitioned, per-socket replicated CSR.
//!
//! Loading happens in two stages. [`EdgeListGraph::load`] renumbers vertex
//! names to a dense `[0, V)` range, counts degrees, and sorts vertices by
//! descending degree, which is all the planner needs to cost candidate layouts.
//! [`EdgeListGraph::build`] then applies a [`GraphHint`]: it tiles the vertex
//! range into partitions, spreads the heaviest vertices across the first
//! partitions, assigns partitions to sockets, and scatters the edges into
//! per-socket arenas.
//!
//! Physically, each socket holds a full `AdjList[V]` whose `begin` pointers
//! reach into the arena of whichever socket owns the vertex's partition;
//! only the adjacency metadata is replicated, the edges exist once. The
//! socket-0 view is canonical for tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::info;

use crate::bloom::BloomFilter;
use crate::mem::{MemoryPool, Placement, SharedSlice};
use crate::partition::{self, GroupHeader, VertexUnit};
use crate::plan::{GraphHint, GroupHint};
use crate::topo::{ThreadConfig, Threads};
use crate::types::{Edge, Eid, SamplerClass, Vid};
use crate::{Error, Result};

const VID_NONE: Vid = Vid::MAX;

/// One neighbor entry in an edge arena.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjUnit {
    pub neighbor: Vid,
}

/// Per-vertex adjacency metadata: degree plus a pointer into the owning
/// socket's edge arena. Replicated on every socket.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AdjList {
    pub degree: Vid,
    pub begin: *const AdjUnit,
}

// Safety: `begin` points into pool-owned arenas that live as long as the
// Graph and are immutable after build.
unsafe impl Send for AdjList {}
unsafe impl Sync for AdjList {}

/// Loaded, renumbered, degree-sorted edge list; the planner's input.
pub struct EdgeListGraph {
    pub v_num: Vid,
    pub e_num: Eid,
    pub as_undirected: bool,
    pub(crate) raw_edges: Vec<Edge>,
    pub(crate) name2id: Vec<Vid>,
    pub(crate) vertex_units: Vec<VertexUnit>,
    /// Prefix sums of degree over the sorted vertex order; the planner's
    /// edge-count oracle.
    pub degree_prefix_sum: Vec<Eid>,
}

impl EdgeListGraph {
    /// Renumber, count degrees, and degree-sort the input edges. With
    /// `as_undirected`, each input edge also counts transposed.
    pub fn load(
        mut edges: Vec<Edge>,
        as_undirected: bool,
        threads: &Threads,
    ) -> Result<Self> {
        if edges.is_empty() {
            return Err(Error::InvalidInput("edge list is empty".into()));
        }

        // Dense ids in first-seen order.
        let mut name2id: Vec<Vid> = Vec::new();
        let mut v_num: Vid = 0;
        for e in edges.iter_mut() {
            let top = e.src.max(e.dst) as usize;
            if top >= name2id.len() {
                name2id.resize(top + 1, VID_NONE);
            }
            for end in [&mut e.src, &mut e.dst] {
                if name2id[*end as usize] == VID_NONE {
                    name2id[*end as usize] = v_num;
                    v_num += 1;
                }
                *end = name2id[*end as usize];
            }
        }
        let e_num = edges.len() as Eid * if as_undirected { 2 } else { 1 };
        info!(vertices = v_num, edges = e_num, as_undirected, "loaded edge list");

        let degrees: Vec<AtomicU32> = (0..v_num).map(|_| AtomicU32::new(0)).collect();
        threads.install(|| {
            edges.par_iter().for_each(|e| {
                degrees[e.src as usize].fetch_add(1, Ordering::Relaxed);
                if as_undirected {
                    degrees[e.dst as usize].fetch_add(1, Ordering::Relaxed);
                }
            });
        });

        let isolated = degrees.iter().filter(|d| d.load(Ordering::Relaxed) == 0).count();
        if isolated != 0 {
            return Err(Error::InvalidInput(format!(
                "{isolated} vertices have no outgoing edge; a walker starting there \
                 would have nothing to sample"
            )));
        }

        let mut vertex_units: Vec<VertexUnit> = degrees
            .iter()
            .enumerate()
            .map(|(v, d)| VertexUnit { vertex: v as Vid, degree: d.load(Ordering::Relaxed) })
            .collect();
        counting_sort_desc(&mut vertex_units);

        let mut degree_prefix_sum = Vec::with_capacity(v_num as usize + 1);
        degree_prefix_sum.push(0);
        let mut acc: Eid = 0;
        for u in &vertex_units {
            acc += u.degree as Eid;
            degree_prefix_sum.push(acc);
        }

        Ok(Self { v_num, e_num, as_undirected, raw_edges: edges, name2id, vertex_units, degree_prefix_sum })
    }

    /// Edge count of the sorted-vertex range `[begin, end)`.
    pub fn range_edges(&self, begin: Vid, end: Vid) -> Eid {
        self.degree_prefix_sum[end as usize] - self.degree_prefix_sum[begin as usize]
    }

    /// Apply a planner hint: partition, renumber, and scatter into the
    /// per-socket CSR.
    pub fn build(mut self, hint: &GraphHint, cfg: &ThreadConfig, threads: &Threads) -> Result<Graph> {
        let pool = MemoryPool::new(cfg.clone());
        let v_num = self.v_num;
        let group_bits = hint.group_bits;
        debug_assert!(group_bits < 32);
        let group_mask: Vid = (1u32 << group_bits) - 1;

        // Tile every group into its partitions.
        let mut partition_begin: Vec<Vid> = Vec::new();
        let mut partition_end: Vec<Vid> = Vec::new();
        let mut shuffle_partition_num = 0usize;
        for (g, gh) in hint.group_hints.iter().enumerate() {
            let psize = 1u32 << gh.partition_bits;
            let mut v = gh.vertex_begin;
            while v < gh.vertex_end {
                partition_begin.push(v);
                partition_end.push(v.saturating_add(psize).min(gh.vertex_end));
                v = v.saturating_add(psize);
            }
            if g == 0 {
                shuffle_partition_num = cfg.threads.min(partition_begin.len());
            }
        }
        let partition_num = partition_begin.len();
        if hint.partition_sampler_class.len() != partition_num {
            return Err(Error::InvalidInput(format!(
                "hint carries {} sampler classes for {partition_num} partitions",
                hint.partition_sampler_class.len()
            )));
        }

        // Replicated group headers.
        let bits: Vec<u32> = hint.group_hints.iter().map(|g| g.partition_bits).collect();
        let headers = partition::group_headers(group_bits, &bits);
        let mut groups = Vec::with_capacity(cfg.sockets);
        for s in 0..cfg.sockets {
            let g = pool.alloc::<GroupHeader>(headers.len(), Placement::Node(s))?;
            unsafe { g.slice_mut(0, headers.len()) }.copy_from_slice(&headers);
            groups.push(g);
        }

        // Spread the heaviest vertices across the first partitions.
        partition::zigzag_shuffle(
            &mut self.vertex_units,
            &partition_begin,
            &partition_end,
            shuffle_partition_num,
        );

        let partition_socket = partition::snake_socket_assignment(partition_num, cfg.sockets);
        let socket_partitions = partition::socket_partition_lists(&partition_socket, cfg.sockets);

        // Renumbering table and per-partition stats. Each partition owns a
        // disjoint range of the sorted order, and each original vertex id
        // appears exactly once, so the scattered writes are disjoint.
        let mut id2newid = vec![0 as Vid; v_num as usize];
        let mut partition_edge_num = vec![0 as Eid; partition_num];
        let mut partition_min_degree = vec![0 as Vid; partition_num];
        let mut partition_max_degree = vec![0 as Vid; partition_num];
        {
            let id2newid_view = SharedSlice::from_raw(id2newid.as_mut_ptr(), id2newid.len());
            let units = &self.vertex_units;
            let pb = &partition_begin;
            let pe = &partition_end;
            threads.install(|| {
                partition_edge_num
                    .par_iter_mut()
                    .zip(partition_min_degree.par_iter_mut())
                    .zip(partition_max_degree.par_iter_mut())
                    .enumerate()
                    .for_each(|(p, ((edges, min_d), max_d))| {
                        let mut e: Eid = 0;
                        let mut lo = Vid::MAX;
                        let mut hi = 0;
                        for v in pb[p]..pe[p] {
                            let u = units[v as usize];
                            e += u.degree as Eid;
                            lo = lo.min(u.degree);
                            hi = hi.max(u.degree);
                            unsafe { id2newid_view.set(u.vertex as usize, v) };
                        }
                        *edges = e;
                        *min_d = lo;
                        *max_d = hi;
                    });
            });
        }

        // Rewrite edges to the final numbering.
        {
            let id2newid = &id2newid;
            threads.install(|| {
                self.raw_edges.par_iter_mut().for_each(|e| {
                    e.src = id2newid[e.src as usize];
                    e.dst = id2newid[e.dst as usize];
                });
            });
        }

        // Name mapping for consumers.
        let id2name = pool.alloc::<Vid>(v_num as usize, Placement::Interleaved)?;
        {
            let name2id = &self.name2id;
            let id2newid = &id2newid;
            threads.install(|| {
                name2id.par_iter().enumerate().for_each(|(name, &id)| {
                    if id != VID_NONE {
                        unsafe { id2name.set(id2newid[id as usize] as usize, name as Vid) };
                    }
                });
            });
        }

        // Adjacency metadata, replicated per socket; edges live once, in the
        // arena of the partition's socket.
        let mut adjlists = Vec::with_capacity(cfg.sockets);
        let mut edge_arenas = Vec::with_capacity(cfg.sockets);
        for s in 0..cfg.sockets {
            adjlists.push(pool.alloc::<AdjList>(v_num as usize, Placement::Node(s))?);
            let socket_edges: Eid =
                socket_partitions[s].iter().map(|&p| partition_edge_num[p]).sum();
            edge_arenas.push(pool.alloc::<AdjUnit>(socket_edges as usize, Placement::Node(s))?);
        }

        // Lay out each vertex's span and keep a write cursor for the scatter.
        let mut cursors: Vec<AtomicUsize> = Vec::with_capacity(v_num as usize);
        cursors.resize_with(v_num as usize, || AtomicUsize::new(0));
        for s in 0..cfg.sockets {
            let mut offset = 0usize;
            for &p in &socket_partitions[s] {
                for v in partition_begin[p]..partition_end[p] {
                    let degree = self.vertex_units[v as usize].degree;
                    let begin = unsafe { edge_arenas[s].as_ptr().add(offset) };
                    unsafe { adjlists[0].set(v as usize, AdjList { degree, begin }) };
                    cursors[v as usize].store(begin as usize, Ordering::Relaxed);
                    offset += degree as usize;
                }
            }
        }

        {
            let cursors = &cursors;
            let as_undirected = self.as_undirected;
            let edges = &self.raw_edges;
            threads.install(|| {
                edges.par_iter().for_each(|e| {
                    let slot = cursors[e.src as usize]
                        .fetch_add(std::mem::size_of::<AdjUnit>(), Ordering::Relaxed);
                    unsafe { *(slot as *mut AdjUnit) = AdjUnit { neighbor: e.dst } };
                    if as_undirected {
                        let slot = cursors[e.dst as usize]
                            .fetch_add(std::mem::size_of::<AdjUnit>(), Ordering::Relaxed);
                        unsafe { *(slot as *mut AdjUnit) = AdjUnit { neighbor: e.src } };
                    }
                });
            });
        }

        // Replicate the metadata to the other sockets.
        for s in 1..cfg.sockets {
            let dst = adjlists[s];
            let src = adjlists[0];
            threads.install(|| {
                (0..v_num as usize).into_par_iter().with_min_len(1 << 14).for_each(|v| unsafe {
                    dst.set(v, src.get(v));
                });
            });
        }

        info!(
            partitions = partition_num,
            shuffled = shuffle_partition_num,
            groups = hint.group_hints.len(),
            "built partitioned CSR"
        );

        Ok(Graph {
            cfg: cfg.clone(),
            pool,
            v_num,
            e_num: self.e_num,
            as_undirected: self.as_undirected,
            adjlists,
            edge_arenas,
            id2name,
            group_bits,
            group_mask,
            groups,
            group_hints: hint.group_hints.clone(),
            partition_num,
            shuffle_partition_num,
            partition_begin,
            partition_end,
            partition_sampler_class: hint.partition_sampler_class.clone(),
            partition_socket,
            partition_min_degree,
            partition_max_degree,
            partition_edge_num,
            socket_partitions,
            bloom: None,
        })
    }
}

/// Stable descending counting sort by degree.
fn counting_sort_desc(units: &mut [VertexUnit]) {
    let max_degree = units.iter().map(|u| u.degree).max().unwrap_or(0) as usize;
    let mut counts = vec![0 as Vid; max_degree + 1];
    for u in units.iter() {
        counts[u.degree as usize] += 1;
    }
    let mut offsets = vec![0 as Vid; max_degree + 1];
    let mut acc: Vid = 0;
    for d in (0..=max_degree).rev() {
        offsets[d] = acc;
        acc += counts[d];
    }
    let snapshot = units.to_vec();
    for u in snapshot {
        let pos = offsets[u.degree as usize];
        offsets[u.degree as usize] += 1;
        units[pos as usize] = u;
    }
}

/// The built graph: per-socket CSR plus the partition/group directory.
pub struct Graph {
    cfg: ThreadConfig,
    // Owns every arena below; dropped last.
    #[allow(dead_code)]
    pool: MemoryPool,
    pub v_num: Vid,
    pub e_num: Eid,
    pub as_undirected: bool,
    adjlists: Vec<SharedSlice<AdjList>>,
    #[allow(dead_code)]
    edge_arenas: Vec<SharedSlice<AdjUnit>>,
    id2name: SharedSlice<Vid>,
    pub group_bits: u32,
    pub group_mask: Vid,
    groups: Vec<SharedSlice<GroupHeader>>,
    pub group_hints: Vec<GroupHint>,
    pub partition_num: usize,
    pub shuffle_partition_num: usize,
    pub partition_begin: Vec<Vid>,
    pub partition_end: Vec<Vid>,
    pub partition_sampler_class: Vec<SamplerClass>,
    pub partition_socket: Vec<usize>,
    pub partition_min_degree: Vec<Vid>,
    pub partition_max_degree: Vec<Vid>,
    pub partition_edge_num: Vec<Eid>,
    pub socket_partitions: Vec<Vec<usize>>,
    bloom: Option<BloomFilter>,
}

impl Graph {
    /// O(1) hot-path lookup via the socket-local group header.
    #[inline]
    pub fn vertex_partition_on(&self, socket: usize, v: Vid) -> usize {
        let g = (v >> self.group_bits) as usize;
        let gh = unsafe { self.groups[socket].get(g) };
        (((v & self.group_mask) >> gh.partition_bits) + gh.partition_offset) as usize
    }

    #[inline]
    pub fn vertex_partition(&self, v: Vid) -> usize {
        self.vertex_partition_on(0, v)
    }

    pub fn partition_group(&self, p: usize) -> usize {
        (self.partition_begin[p] >> self.group_bits) as usize
    }

    #[inline]
    pub fn adjlist(&self, socket: usize, v: Vid) -> AdjList {
        unsafe { self.adjlists[socket].get(v as usize) }
    }

    pub(crate) fn adjlists_on(&self, socket: usize) -> SharedSlice<AdjList> {
        self.adjlists[socket]
    }

    pub fn neighbors(&self, socket: usize, v: Vid) -> &[AdjUnit] {
        let a = self.adjlist(socket, v);
        if a.degree == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(a.begin, a.degree as usize) }
    }

    /// Sort every adjacency list and build the Bloom filter so
    /// [`Graph::has_neighbor`] works. Required before node2vec walks.
    pub fn prepare_neighbor_query(&mut self, threads: &Threads) -> Result<()> {
        let v_num = self.v_num;
        let adjlists = self.adjlists[0];
        threads.install(|| {
            (0..v_num).into_par_iter().try_for_each(|v| {
                let a = unsafe { adjlists.get(v as usize) };
                let span = unsafe {
                    std::slice::from_raw_parts_mut(a.begin as *mut AdjUnit, a.degree as usize)
                };
                span.sort_unstable_by_key(|u| u.neighbor);
                if span.iter().any(|u| u.neighbor == v) {
                    return Err(Error::InvalidInput(format!(
                        "self-loop on vertex {v}: the second-order acceptance test \
                         cannot distinguish a return step from a self-loop"
                    )));
                }
                Ok(())
            })
        })?;

        let items = if self.as_undirected { self.e_num / 2 } else { self.e_num };
        let bloom = BloomFilter::new(&self.pool, items)?;
        {
            let bloom = &bloom;
            threads.install(|| {
                (0..v_num).into_par_iter().for_each(|v| {
                    let a = unsafe { adjlists.get(v as usize) };
                    let span = unsafe { std::slice::from_raw_parts(a.begin, a.degree as usize) };
                    for u in span {
                        bloom.insert(v, u.neighbor);
                    }
                });
            });
        }
        self.bloom = Some(bloom);
        info!(items, "prepared neighborhood query");
        Ok(())
    }

    pub fn has_neighbor_index(&self) -> bool {
        self.bloom.is_some()
    }

    /// Exact membership test: Bloom gate, then binary search in the
    /// (sorted) adjacency of `src` as seen from `socket`.
    #[inline]
    pub fn has_neighbor(&self, src: Vid, dst: Vid, socket: usize) -> bool {
        let bloom = self.bloom.as_ref().expect("prepare_neighbor_query not called");
        if !bloom.contains(src, dst) {
            return false;
        }
        self.neighbors(socket, src)
            .binary_search_by_key(&dst, |u| u.neighbor)
            .is_ok()
    }

    pub fn bloom_size_bytes(&self) -> u64 {
        self.bloom.as_ref().map_or(0, |b| b.size_bytes())
    }

    /// Original vertex names, indexed by dense id.
    pub fn id2name(&self) -> &[Vid] {
        unsafe { self.id2name.slice(0, self.v_num as usize) }
    }

    /// The directed edge multiset as seen from one socket's metadata.
    pub fn edge_multiset(&self, socket: usize) -> Vec<Edge> {
        let mut edges = Vec::with_capacity(self.e_num as usize);
        for v in 0..self.v_num {
            for u in self.neighbors(socket, v) {
                edges.push(Edge::new(v, u.neighbor));
            }
        }
        edges
    }

    /// The edge multiset mapped back to original names (round-trip tests).
    pub fn named_edge_multiset(&self) -> Vec<Edge> {
        let names = self.id2name();
        self.edge_multiset(0)
            .into_iter()
            .map(|e| Edge::new(names[e.src as usize], names[e.dst as usize]))
            .collect()
    }

    /// Resident bytes of the replicated CSR.
    pub fn memory_size(&self) -> u64 {
        std::mem::size_of::<AdjList>() as u64 * self.v_num as u64 * self.cfg.sockets as u64
            + std::mem::size_of::<AdjUnit>() as u64 * self.e_num
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.cfg
    }
}

// Safety: all interior raw pointers target pool-owned memory that is
// immutable after build (adjacency sort happens before sharing with walk
// threads, behind &mut self).
unsafe impl Send for Graph {}
unsafe impl Sync for Graph {}
