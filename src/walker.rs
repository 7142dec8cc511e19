//! Walker index space: per-socket/per-thread ranges and the work-stealing
//! iteration primitive.
//!
//! The epoch's walker ids `[0, W)` are split page-aligned across sockets
//! (so each socket's segment of a walker array can be bound to its node)
//! and cache-line-aligned across threads within a socket.
//! [`WalkerManager::process_walkers`] visits every active walker exactly
//! once: each thread drains its own range in chunks of 64 via fetch-add,
//! then steals from peers in `(socket, thread)` rotation order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Barrier;

use crate::mem::{MemoryPool, Placement, SharedSlice, CACHE_LINE, PAGE_SIZE};
use crate::topo::{ThreadConfig, Threads};
use crate::types::{Pid, Wid};
use crate::Result;

const STEAL_CHUNK: u64 = 64;

/// Per-thread progress, padded to a cache line. `curr` is bumped by owner
/// and thieves alike; `working` flips once, with release/acquire pairing.
#[repr(C, align(64))]
pub struct ThreadState {
    curr: AtomicU64,
    end: AtomicU64,
    working: AtomicBool,
}

pub struct WalkerManager {
    cfg: ThreadConfig,
    pool: MemoryPool,
    pub max_epoch_walkers: Wid,
    pub socket_begin: Vec<Wid>,
    pub socket_end: Vec<Wid>,
    /// Indexed by global thread id.
    pub thread_begin: Vec<Wid>,
    pub thread_end: Vec<Wid>,
    states: Vec<SharedSlice<ThreadState>>,
}

impl WalkerManager {
    pub fn new(cfg: &ThreadConfig, max_epoch_walkers: Wid) -> Result<Self> {
        let pool = MemoryPool::new(cfg.clone());

        // Socket ranges land on page boundaries for the smallest element
        // type we stripe (u16 partition ids).
        let page_walkers = (PAGE_SIZE / std::mem::size_of::<Pid>()) as Wid;
        let per_socket =
            max_epoch_walkers / cfg.sockets as Wid / page_walkers * page_walkers;
        let mut socket_begin = Vec::with_capacity(cfg.sockets);
        let mut socket_end = Vec::with_capacity(cfg.sockets);
        let mut remaining = max_epoch_walkers;
        for s in 0..cfg.sockets {
            let span = if s + 1 == cfg.sockets { remaining } else { per_socket.min(remaining) };
            remaining -= span;
            let begin = if s == 0 { 0 } else { socket_end[s - 1] };
            socket_begin.push(begin);
            socket_end.push(begin + span);
        }

        // Thread ranges land on cache-line boundaries.
        let chunk_walkers = (CACHE_LINE / std::mem::size_of::<Pid>()) as Wid;
        let per_thread =
            max_epoch_walkers / cfg.threads as Wid / chunk_walkers * chunk_walkers;
        let spt = cfg.socket_threads();
        let mut thread_begin = vec![0 as Wid; cfg.threads];
        let mut thread_end = vec![0 as Wid; cfg.threads];
        for s in 0..cfg.sockets {
            let mut remaining = socket_end[s] - socket_begin[s];
            for t in 0..spt {
                let tid = s * spt + t;
                let span = if t + 1 == spt { remaining } else { per_thread.min(remaining) };
                remaining -= span;
                thread_begin[tid] =
                    if t == 0 { socket_begin[s] } else { thread_end[s * spt + t - 1] };
                thread_end[tid] = thread_begin[tid] + span;
            }
        }

        let mut states = Vec::with_capacity(cfg.threads);
        for tid in 0..cfg.threads {
            // Zeroed atomics are valid initial state.
            let state =
                pool.alloc::<ThreadState>(1, Placement::Node(cfg.socket_of(tid)))?;
            states.push(state);
        }

        Ok(Self {
            cfg: cfg.clone(),
            pool,
            max_epoch_walkers,
            socket_begin,
            socket_end,
            thread_begin,
            thread_end,
            states,
        })
    }

    fn state(&self, tid: usize) -> &ThreadState {
        unsafe { self.states[tid].at(0) }
    }

    /// One anonymous mapping of `max_epoch_walkers * len` elements whose
    /// socket segments are bound to their nodes. Socket boundaries are page
    /// multiples for every `len >= 1` and element size >= 2.
    pub fn alloc_array<T>(&self, len: usize) -> Result<SharedSlice<T>> {
        let segments: Vec<(usize, usize, usize)> = (0..self.cfg.sockets)
            .map(|s| {
                (
                    self.socket_begin[s] as usize * len,
                    self.socket_end[s] as usize * len,
                    s,
                )
            })
            .collect();
        self.pool
            .alloc_striped::<T>(self.max_epoch_walkers as usize * len, &segments)
    }

    /// Visit every walker id below `active` exactly once, calling
    /// `f(executing_thread, walker)`.
    pub fn process_walkers<F>(&self, threads: &Threads, active: Wid, f: F)
    where
        F: Fn(usize, Wid) + Sync,
    {
        let cfg = &self.cfg;
        let spt = cfg.socket_threads();
        let barrier = Barrier::new(cfg.threads);
        threads.broadcast(|tid| {
            let own = self.state(tid);
            own.curr.store(self.thread_begin[tid] as u64, Ordering::Relaxed);
            own.end
                .store(self.thread_end[tid].min(active) as u64, Ordering::Relaxed);
            own.working.store(true, Ordering::Release);
            barrier.wait();

            let socket = cfg.socket_of(tid);
            let offset = cfg.socket_offset(tid);
            for s_off in 0..cfg.sockets {
                for t_off in 0..spt {
                    let s = (socket + s_off) % cfg.sockets;
                    let t = (offset + t_off) % spt;
                    let victim = self.state(s * spt + t);
                    let end = victim.end.load(Ordering::Acquire);
                    while victim.working.load(Ordering::Acquire) {
                        let begin = victim.curr.fetch_add(STEAL_CHUNK, Ordering::Relaxed);
                        if begin >= end {
                            break;
                        }
                        let chunk_end = (begin + STEAL_CHUNK).min(end);
                        for w in begin..chunk_end {
                            f(tid, w as Wid);
                        }
                    }
                    if s_off == 0 && t_off == 0 {
                        // Own range drained; open it to thieves' skip path.
                        victim.working.store(false, Ordering::Release);
                    }
                }
            }
        });
    }
}
