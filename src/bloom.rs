//! Approximate membership for undirected edges.
//!
//! node2vec's acceptance test asks "is `(prev, cand)` an edge?" for nearly
//! every rejected candidate. The filter answers most negatives without
//! touching the adjacency lists; a positive is confirmed by binary search,
//! so the combined test is exact. False negatives are impossible because
//! every edge is inserted at build time.
//!
//! Layout: a power-of-two table of 64-bit words. An edge `(u, v)` is packed
//! as `(min << 32) | max`, hashed with SplitMix64 to pick a word, and sets
//! four bits of that word derived from a Fletcher-16 accumulation over the
//! key's 16-bit halves. At 16 bits per element and 25% word load the
//! expected false-positive rate is about `(4/64)^4 ≈ 1.5e-5`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::mem::{MemoryPool, Placement, SharedSlice};
use crate::rng::splitmix64;
use crate::types::Vid;
use crate::Result;

pub struct BloomFilter {
    table: SharedSlice<AtomicU64>,
    mask: u64,
}

impl BloomFilter {
    /// Smallest power-of-two word count (min 4) with `capacity > items / 4`.
    pub fn table_capacity(items: u64) -> u64 {
        let mut cap = 4u64;
        while cap <= items / 4 {
            cap *= 2;
        }
        cap
    }

    pub fn table_bytes(items: u64) -> u64 {
        Self::table_capacity(items) * 8
    }

    /// Allocate the table (interleaved: build writes come from all sockets,
    /// query reads from all sockets).
    pub fn new(pool: &MemoryPool, items: u64) -> Result<Self> {
        let cap = Self::table_capacity(items);
        let table = pool.alloc::<AtomicU64>(cap as usize, Placement::Interleaved)?;
        Ok(Self { table, mask: cap - 1 })
    }

    fn key(u: Vid, v: Vid) -> u64 {
        let (lo, hi) = if u <= v { (u, v) } else { (v, u) };
        ((lo as u64) << 32) | hi as u64
    }

    fn index(&self, key: u64) -> usize {
        (splitmix64(key) & self.mask) as usize
    }

    /// Four set bits derived from Fletcher-16 over the four 16-bit halves.
    fn pattern(key: u64) -> u64 {
        let mut sum1: u32 = 0;
        let mut sum2: u32 = 0;
        let mut bits = 0u64;
        for i in 0..4 {
            let half = ((key >> (16 * i)) & 0xffff) as u32;
            sum1 = (sum1 + half) % 65535;
            sum2 = (sum2 + sum1) % 65535;
            bits |= 1u64 << (sum2 & 63);
        }
        bits
    }

    pub fn insert(&self, u: Vid, v: Vid) {
        let key = Self::key(u, v);
        let word = unsafe { self.table.at(self.index(key)) };
        // Count-free set bits; relaxed is enough, queries only start after
        // the build barrier.
        word.fetch_or(Self::pattern(key), Ordering::Relaxed);
    }

    pub fn contains(&self, u: Vid, v: Vid) -> bool {
        let key = Self::key(u, v);
        let word = unsafe { self.table.at(self.index(key)) };
        let pattern = Self::pattern(key);
        word.load(Ordering::Relaxed) & pattern == pattern
    }

    pub fn size_bytes(&self) -> u64 {
        self.table.len() as u64 * 8
    }
}
