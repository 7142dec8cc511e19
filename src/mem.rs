//! NUMA-aware pooled memory.
//!
//! Every long-lived buffer in the engine comes out of a [`MemoryPool`]:
//! anonymous zeroed mappings, sized to cache-line multiples, optionally bound
//! to a NUMA node (or interleaved) with `mbind(2)`. The pool owns all of its
//! mappings and releases them together on drop; everything else in the crate
//! holds non-owning [`SharedSlice`] views into pool memory.
//!
//! [`SharedSlice`] is the crate's one escape hatch from the borrow checker:
//! a raw pointer + length pair that is `Send + Sync`. Its accessors are
//! `unsafe`, and every call site relies on the same invariant the scheduler
//! enforces, *thread-to-range ownership*: during any parallel phase, each
//! element of a shared buffer is read/written by exactly one thread, and
//! phases are separated by barriers.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Mutex;

use crate::topo::ThreadConfig;
use crate::{Error, Result};

pub const CACHE_LINE: usize = 64;
pub const PAGE_SIZE: usize = 4096;

pub fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Where an allocation should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// No NUMA preference.
    Ignore,
    /// Pages interleaved across all configured sockets.
    Interleaved,
    /// Bound to one logical socket (mapped to its physical node).
    Node(usize),
}

/// Non-owning view of pool memory, freely copyable across threads.
pub struct SharedSlice<T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for SharedSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SharedSlice<T> {}

// Safety: SharedSlice is a view into pool-owned memory; synchronization is
// external (thread-to-range ownership, see module doc).
unsafe impl<T: Send> Send for SharedSlice<T> {}
unsafe impl<T: Send> Sync for SharedSlice<T> {}

impl<T> SharedSlice<T> {
    pub fn empty() -> Self {
        Self { ptr: ptr::NonNull::dangling().as_ptr(), len: 0, _marker: PhantomData }
    }

    pub fn from_raw(ptr: *mut T, len: usize) -> Self {
        Self { ptr, len, _marker: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    /// # Safety
    /// Caller owns element `i` for the duration of the access (see module doc).
    #[inline]
    pub unsafe fn get(&self, i: usize) -> T
    where
        T: Copy,
    {
        debug_assert!(i < self.len);
        *self.ptr.add(i)
    }

    /// # Safety
    /// Caller owns element `i` for the duration of the access.
    #[inline]
    pub unsafe fn set(&self, i: usize, value: T) {
        debug_assert!(i < self.len);
        *self.ptr.add(i) = value;
    }

    /// # Safety
    /// Element `i` must not be mutated non-atomically while the reference
    /// lives. Used for shared atomics and read-only views.
    #[inline]
    pub unsafe fn at(&self, i: usize) -> &T {
        debug_assert!(i < self.len);
        &*self.ptr.add(i)
    }

    /// # Safety
    /// Caller exclusively owns element `i` while the reference lives.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn at_mut(&self, i: usize) -> &mut T {
        debug_assert!(i < self.len);
        &mut *self.ptr.add(i)
    }

    /// # Safety
    /// Caller owns `[lo, hi)` read-only while the slice lives.
    #[inline]
    pub unsafe fn slice(&self, lo: usize, hi: usize) -> &[T] {
        debug_assert!(lo <= hi && hi <= self.len);
        std::slice::from_raw_parts(self.ptr.add(lo), hi - lo)
    }

    /// # Safety
    /// Caller exclusively owns `[lo, hi)` while the slice lives.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, lo: usize, hi: usize) -> &mut [T] {
        debug_assert!(lo <= hi && hi <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(lo), hi - lo)
    }
}

/// Single-value cell with thread-id-gated access, used for per-thread and
/// per-partition state that the scheduler hands to exactly one thread at a
/// time.
pub struct SyncCell<T>(UnsafeCell<T>);

// Safety: access discipline is external, as with SharedSlice.
unsafe impl<T: Send> Sync for SyncCell<T> {}
unsafe impl<T: Send> Send for SyncCell<T> {}

impl<T> SyncCell<T> {
    pub fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// # Safety
    /// Caller must be the cell's unique accessor for the reference lifetime.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.0.get()
    }
}

/// Pre-tally of a contiguous arena: components with identical lifetime are
/// counted first, then carved out of one mapping.
#[derive(Debug, Default, Clone)]
pub struct MemoryCounter {
    bytes: usize,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T>(&mut self, count: usize) {
        debug_assert!(std::mem::align_of::<T>() <= CACHE_LINE);
        self.bytes += align_up(std::mem::size_of::<T>() * count, CACHE_LINE);
    }

    pub fn total(&self) -> usize {
        self.bytes
    }
}

/// Cursor over one pool mapping, subdividing it in the same order the
/// counter tallied it.
pub struct Arena {
    base: *mut u8,
    len: usize,
    cursor: usize,
}

impl Arena {
    pub fn take<T>(&mut self, count: usize) -> SharedSlice<T> {
        debug_assert!(std::mem::align_of::<T>() <= CACHE_LINE);
        let bytes = align_up(std::mem::size_of::<T>() * count, CACHE_LINE);
        assert!(
            self.cursor + bytes <= self.len,
            "arena overrun: counter and takes disagree"
        );
        let ptr = unsafe { self.base.add(self.cursor) } as *mut T;
        self.cursor += bytes;
        SharedSlice::from_raw(ptr, count)
    }
}

struct Mapping {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Mapping {}

/// Owns every engine allocation; drops them together.
pub struct MemoryPool {
    cfg: ThreadConfig,
    mappings: Mutex<Vec<Mapping>>,
}

impl MemoryPool {
    pub fn new(cfg: ThreadConfig) -> Self {
        Self { cfg, mappings: Mutex::new(Vec::new()) }
    }

    /// Allocate `count` zeroed `T`s with the given placement.
    pub fn alloc<T>(&self, count: usize, placement: Placement) -> Result<SharedSlice<T>> {
        let mut counter = MemoryCounter::new();
        counter.add::<T>(count);
        let mut arena = self.arena(&counter, placement)?;
        Ok(arena.take::<T>(count))
    }

    /// One mapping for several same-lifetime components; carve it with
    /// [`Arena::take`] in the order the counter was filled.
    pub fn arena(&self, counter: &MemoryCounter, placement: Placement) -> Result<Arena> {
        let len = align_up(counter.total().max(1), PAGE_SIZE);
        let base = self.map(len)?;
        match placement {
            Placement::Ignore => {}
            Placement::Interleaved => {
                if self.cfg.with_numa() {
                    let nodes: Vec<usize> =
                        (0..self.cfg.sockets).map(|s| self.cfg.physical_socket(s)).collect();
                    bind_interleaved(base, len, &nodes)?;
                }
            }
            Placement::Node(socket) => {
                if socket >= self.cfg.sockets {
                    return Err(Error::InvalidPlacement(format!(
                        "socket {socket} out of range ({} configured)",
                        self.cfg.sockets
                    )));
                }
                if self.cfg.with_numa() {
                    bind_to_node(base, len, self.cfg.physical_socket(socket))?;
                }
            }
        }
        Ok(Arena { base, len, cursor: 0 })
    }

    /// One mapping whose page-aligned element ranges are bound to different
    /// sockets. Used for walker-indexed arrays split across sockets.
    ///
    /// Each `(elem_begin, elem_end, socket)` byte range must start and end on
    /// page boundaries (the walker manager's socket split guarantees this).
    pub fn alloc_striped<T>(
        &self,
        total: usize,
        segments: &[(usize, usize, usize)],
    ) -> Result<SharedSlice<T>> {
        let elem = std::mem::size_of::<T>();
        let len = align_up((total * elem).max(1), PAGE_SIZE);
        let base = self.map(len)?;
        if self.cfg.with_numa() {
            for &(begin, end, socket) in segments {
                if end <= begin {
                    continue;
                }
                let byte_begin = begin * elem;
                let byte_len = (end - begin) * elem;
                debug_assert_eq!(byte_begin % PAGE_SIZE, 0);
                bind_to_node(
                    unsafe { base.add(byte_begin) },
                    align_up(byte_len, PAGE_SIZE).min(len - byte_begin),
                    self.cfg.physical_socket(socket),
                )?;
            }
        }
        // Touch the mapping so page placement happens now, not mid-walk.
        unsafe { ptr::write_bytes(base, 0, len) };
        Ok(SharedSlice::from_raw(base as *mut T, total))
    }

    fn map(&self, len: usize) -> Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory { requested: len });
        }
        self.mappings
            .lock()
            .expect("memory pool mutex poisoned")
            .push(Mapping { ptr: ptr as *mut u8, len });
        Ok(ptr as *mut u8)
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let mappings = self.mappings.get_mut().expect("memory pool mutex poisoned");
        for m in mappings.drain(..) {
            unsafe {
                libc::munmap(m.ptr as *mut libc::c_void, m.len);
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod numa {
    use crate::{Error, Result};

    const MPOL_BIND: libc::c_int = 2;
    const MPOL_INTERLEAVE: libc::c_int = 3;
    const MASK_WORDS: usize = 16;

    fn mbind(ptr: *mut u8, len: usize, mode: libc::c_int, nodes: &[usize]) -> Result<()> {
        let mut mask = [0 as libc::c_ulong; MASK_WORDS];
        for &node in nodes {
            if node >= MASK_WORDS * 64 {
                return Err(Error::InvalidPlacement(format!("node {node} beyond mask")));
            }
            mask[node / 64] |= 1 << (node % 64);
        }
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr as *mut libc::c_void,
                len,
                mode,
                mask.as_ptr(),
                (MASK_WORDS * 64 + 1) as libc::c_ulong,
                0 as libc::c_uint,
            )
        };
        if rc != 0 {
            return Err(Error::InvalidPlacement(format!(
                "mbind to nodes {nodes:?} failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn bind_to_node(ptr: *mut u8, len: usize, node: usize) -> Result<()> {
        mbind(ptr, len, MPOL_BIND, &[node])
    }

    pub fn bind_interleaved(ptr: *mut u8, len: usize, nodes: &[usize]) -> Result<()> {
        mbind(ptr, len, MPOL_INTERLEAVE, nodes)
    }
}

#[cfg(not(target_os = "linux"))]
mod numa {
    use crate::{Error, Result};

    pub fn bind_to_node(_ptr: *mut u8, _len: usize, _node: usize) -> Result<()> {
        Err(Error::InvalidPlacement("NUMA binding requires Linux".into()))
    }

    pub fn bind_interleaved(_ptr: *mut u8, _len: usize, _nodes: &[usize]) -> Result<()> {
        Err(Error::InvalidPlacement("NUMA binding requires Linux".into()))
    }
}

use numa::{bind_interleaved, bind_to_node};
