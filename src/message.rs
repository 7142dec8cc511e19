//! Walker shuffling: group active walkers by the partition of their current
//! vertex, and scatter sampled results back into walker order.
//!
//! Each worker thread owns one [`MessageTask`]: a scratch region covering
//! its contiguous walker range. One step makes two passes over that range:
//!
//! 1. **prepare + scatter**: count walkers per partition, prefix-sum the
//!    counts into bucket offsets, then copy each walker's current vertex
//!    (and, for node2vec, its previous vertex) into its partition's bucket.
//! 2. **update**: after the walk phase overwrote every bucket in place
//!    with sampled neighbors, re-walk the range in the same order, popping
//!    from `bucket_begin` cursors. Identical iteration order is what makes
//!    the permutation unwind exactly.
//!
//! Tasks are mutable scratch used without locks; exclusivity is by thread
//! index, never through a shared handle.

use crate::graph::Graph;
use crate::mem::{MemoryCounter, MemoryPool, Placement, SharedSlice, SyncCell};
use crate::topo::{ThreadConfig, Threads};
use crate::types::{Pid, Vid, Wid};
use crate::walker::WalkerManager;
use crate::Result;

pub struct MessageTask {
    socket: usize,
    /// The thread's full walker range; the active range is re-clamped from
    /// these at every shuffle.
    full_begin: Wid,
    full_end: Wid,
    origin_begin: Wid,
    origin_end: Wid,
    bucket_begin: SharedSlice<Wid>,
    bucket_end: SharedSlice<Wid>,
    shuffled_vertices: SharedSlice<Vid>,
    shuffled_states: SharedSlice<Vid>,
    partition_ids: SharedSlice<Pid>,
}

impl MessageTask {
    /// Count destinations and lay out the buckets.
    fn prepare(&mut self, graph: &Graph, origin: SharedSlice<Vid>) {
        let partitions = self.bucket_end.len();
        let ends = unsafe { self.bucket_end.slice_mut(0, partitions) };
        ends.fill(0);
        for m in self.origin_begin..self.origin_end {
            let v = unsafe { origin.get(m as usize) };
            let p = graph.vertex_partition_on(self.socket, v);
            unsafe { self.partition_ids.set(m as usize, p as Pid) };
            ends[p] += 1;
        }
        let begins = unsafe { self.bucket_begin.slice_mut(0, partitions) };
        let mut counter: Wid = 0;
        for p in 0..partitions {
            begins[p] = counter;
            counter += ends[p];
        }
        // Leave the end cursors at the starts; scatter advances them to the
        // real ends.
        ends.copy_from_slice(begins);
    }

    /// Copy messages (and states, when present) into their buckets.
    fn scatter(&mut self, origin: SharedSlice<Vid>, states: Option<SharedSlice<Vid>>) {
        for m in self.origin_begin..self.origin_end {
            let p = unsafe { self.partition_ids.get(m as usize) } as usize;
            let slot = unsafe { self.bucket_end.get(p) };
            unsafe { self.bucket_end.set(p, slot + 1) };
            unsafe {
                self.shuffled_vertices.set(slot as usize, origin.get(m as usize));
            }
            if let Some(states) = states {
                unsafe { self.shuffled_states.set(slot as usize, states.get(m as usize)) };
            }
        }
    }

    /// Unwind the permutation: write each bucket element back to its walker.
    fn update(&mut self, target: SharedSlice<Vid>) {
        for m in self.origin_begin..self.origin_end {
            let p = unsafe { self.partition_ids.get(m as usize) } as usize;
            let slot = unsafe { self.bucket_begin.get(p) };
            unsafe { self.bucket_begin.set(p, slot + 1) };
            unsafe { target.set(m as usize, self.shuffled_vertices.get(slot as usize)) };
        }
    }

    /// This task's bucket for partition `p`, as scratch-relative offsets.
    #[inline]
    pub fn bucket(&self, p: usize) -> (Wid, Wid) {
        unsafe { (self.bucket_begin.get(p), self.bucket_end.get(p)) }
    }

    pub fn vertices(&self) -> SharedSlice<Vid> {
        self.shuffled_vertices
    }

    pub fn states(&self) -> SharedSlice<Vid> {
        self.shuffled_states
    }

    pub fn walker_range(&self) -> (Wid, Wid) {
        (self.origin_begin, self.origin_end)
    }
}

pub struct MessageManager {
    cfg: ThreadConfig,
    #[allow(dead_code)]
    pool: MemoryPool,
    tasks: Vec<SyncCell<MessageTask>>,
    is_node2vec: bool,
}

impl MessageManager {
    pub fn new(
        graph: &Graph,
        walkers: &WalkerManager,
        is_node2vec: bool,
    ) -> Result<Self> {
        let cfg = graph.config().clone();
        let pool = MemoryPool::new(cfg.clone());
        let partition_ids = walkers.alloc_array::<Pid>(1)?;
        let spt = cfg.socket_threads();

        let mut tasks: Vec<SyncCell<MessageTask>> = Vec::with_capacity(cfg.threads);
        for socket in 0..cfg.sockets {
            // One arena per socket covering all of its threads' scratch.
            let mut counter = MemoryCounter::new();
            for offset in 0..spt {
                let tid = socket * spt + offset;
                let span = (walkers.thread_end[tid] - walkers.thread_begin[tid]) as usize;
                counter.add::<Wid>(graph.partition_num);
                counter.add::<Wid>(graph.partition_num);
                counter.add::<Vid>(span);
                if is_node2vec {
                    counter.add::<Vid>(span);
                }
            }
            let mut arena = pool.arena(&counter, Placement::Node(socket))?;
            for offset in 0..spt {
                let tid = socket * spt + offset;
                let span = (walkers.thread_end[tid] - walkers.thread_begin[tid]) as usize;
                let bucket_begin = arena.take::<Wid>(graph.partition_num);
                let bucket_end = arena.take::<Wid>(graph.partition_num);
                let shuffled_vertices = arena.take::<Vid>(span);
                let shuffled_states = if is_node2vec {
                    arena.take::<Vid>(span)
                } else {
                    SharedSlice::empty()
                };
                tasks.push(SyncCell::new(MessageTask {
                    socket,
                    full_begin: walkers.thread_begin[tid],
                    full_end: walkers.thread_end[tid],
                    origin_begin: walkers.thread_begin[tid],
                    origin_end: walkers.thread_end[tid],
                    bucket_begin,
                    bucket_end,
                    shuffled_vertices,
                    shuffled_states,
                    partition_ids,
                }));
            }
        }
        Ok(Self { cfg, pool, tasks, is_node2vec })
    }

    pub fn is_node2vec(&self) -> bool {
        self.is_node2vec
    }

    /// Prepare and scatter all active walkers. `states` must be `Some` iff
    /// this step's walk phase needs previous vertices.
    pub fn shuffle(
        &self,
        threads: &Threads,
        graph: &Graph,
        current: SharedSlice<Vid>,
        states: Option<SharedSlice<Vid>>,
        active: Wid,
    ) {
        debug_assert!(states.is_none() || self.is_node2vec);
        // Clamp the tail threads' ranges to the active window. Serial: it
        // touches `threads` scalars.
        for cell in &self.tasks {
            let t = unsafe { cell.get_mut() };
            t.origin_begin = t.full_begin.min(active);
            t.origin_end = t.full_end.min(active);
        }
        threads.broadcast(|tid| {
            let t = unsafe { self.tasks[tid].get_mut() };
            t.prepare(graph, current);
            t.scatter(current, states);
        });
    }

    /// Write sampled buckets back into a walker-ordered column.
    pub fn update(&self, threads: &Threads, target: SharedSlice<Vid>) {
        threads.broadcast(|tid| {
            let t = unsafe { self.tasks[tid].get_mut() };
            t.update(target);
        });
    }

    /// # Safety
    /// During the walk phase the returned reference is read-only metadata;
    /// bucket contents are accessed through [`MessageTask::vertices`] under
    /// the partition-ownership discipline.
    #[inline]
    pub unsafe fn task(&self, tid: usize) -> &MessageTask {
        &*(self.tasks[tid].get_mut() as *mut MessageTask as *const MessageTask)
    }

    pub fn thread_count(&self) -> usize {
        self.cfg.threads
    }
}
