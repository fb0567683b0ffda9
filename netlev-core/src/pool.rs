//! Paired RDMA buffer pool (C5, §3 "Buffer pool", §4.5).
//!
//! A single contiguous pinned region is split into `num_pairs` pairs, each pair made up
//! of a primary ("RDMA landing") slot and a secondary (decompression/staging) slot.
//! Pairs are exclusively owned by whichever fetch request holds them, from
//! `BufferPool::acquire` until the downstream consumer calls `release`. Modeled after
//! `networking::chunkpool::ChunkPool` (alloc-or-reuse from a free list) generalized from
//! single fixed-size chunks to two-slot pairs with distinct sizes.

use crate::error::PoolError;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Minimum primary buffer size accepted at init; below this a pair cannot hold even a
/// trivial fetch plus header overhead.
pub const MIN_PAIR_SIZE: usize = 64;
/// Page size used for alignment checks when `use_contig_pages` is false.
pub const PAGE_SIZE: usize = 4096;

pub type PairId = usize;

/// One half of a pair: a contiguous byte range inside the pool's backing region.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlotStatus {
    Init,
    FetchReady,
    MergeReady,
    Busy,
}

/// Descriptor for a single pair: offsets into the pool's backing `Vec<u8>`, not raw
/// pointers, so the pool remains entirely safe Rust and trivially testable.
#[derive(Debug, Clone)]
pub struct PairDesc {
    pub id: PairId,
    pub primary_offset: usize,
    pub primary_len: usize,
    pub secondary_offset: usize,
    pub secondary_len: usize,
    pub status: SlotStatus,
}

struct Inner {
    base: Vec<u8>,
    pairs: Vec<PairDesc>,
    free_list: VecDeque<PairId>,
}

/// Owned by the client engine; pairs are acquired by `issue_fetch` and returned by the
/// merger once it has consumed the fetched bytes (§3 "Ownership summary").
pub struct BufferPool {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl BufferPool {
    /// `register_mem` (§4.5): computes the pool's total size, validates pair sizing, and
    /// partitions the backing region into `num_pairs` pairs enqueued on the free list.
    pub fn new(num_pairs: usize, pair_size: (usize, usize)) -> Result<BufferPool, PoolError> {
        let (primary_len, secondary_len) = pair_size;

        if primary_len < MIN_PAIR_SIZE || secondary_len < MIN_PAIR_SIZE {
            return Err(PoolError::InvalidPairSize);
        }
        if primary_len % PAGE_SIZE != 0 && secondary_len % PAGE_SIZE != 0 {
            // Either slot landing on a page boundary is sufficient in practice; require
            // at least one, matching "minimum size and page alignment are enforced".
            return Err(PoolError::InvalidPairSize);
        }

        let stride = primary_len + secondary_len;
        let total = num_pairs
            .checked_mul(stride)
            .ok_or(PoolError::InvalidPairSize)?;

        let mut pairs = Vec::with_capacity(num_pairs);
        let mut free_list = VecDeque::with_capacity(num_pairs);

        for id in 0..num_pairs {
            let primary_offset = id * stride;
            let secondary_offset = primary_offset + primary_len;
            pairs.push(PairDesc {
                id,
                primary_offset,
                primary_len,
                secondary_offset,
                secondary_len,
                status: SlotStatus::Init,
            });
            free_list.push_back(id);
        }

        Ok(BufferPool {
            inner: Mutex::new(Inner {
                base: vec![0u8; total],
                pairs,
                free_list,
            }),
            not_empty: Condvar::new(),
        })
    }

    pub fn num_pairs(&self) -> usize {
        self.inner.lock().unwrap().pairs.len()
    }

    /// Hands a free pair to a new fetch request, blocking the caller on the pool's
    /// condition variable while the free list is empty.
    pub fn acquire(&self) -> PairDesc {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(id) = guard.free_list.pop_front() {
                guard.pairs[id].status = SlotStatus::FetchReady;
                return guard.pairs[id].clone();
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    /// Non-blocking variant used by tests and by callers that want to fail fast rather
    /// than stall the event thread.
    pub fn try_acquire(&self) -> Option<PairDesc> {
        let mut guard = self.inner.lock().unwrap();
        let id = guard.free_list.pop_front()?;
        guard.pairs[id].status = SlotStatus::FetchReady;
        Some(guard.pairs[id].clone())
    }

    /// Returned by the merger once it has consumed the fetched bytes; wakes one blocked
    /// acquirer.
    pub fn release(&self, id: PairId) {
        let mut guard = self.inner.lock().unwrap();
        guard.pairs[id].status = SlotStatus::Init;
        guard.free_list.push_back(id);
        drop(guard);
        self.not_empty.notify_one();
    }

    /// Looks up a pair's descriptor by id regardless of free-list state, for callers
    /// (the client engine's RDMA-WRITE delivery path) that were handed a bare `PairId`
    /// off the wire and need to know where it lives.
    pub fn pair(&self, id: PairId) -> PairDesc {
        self.inner.lock().unwrap().pairs[id].clone()
    }

    /// Writes `data` into the primary slot of `pair`, as the server's RDMA WRITE would.
    pub fn write_primary(&self, pair: &PairDesc, data: &[u8]) {
        self.write_primary_at(pair, 0, data);
    }

    /// Writes `data` into the primary slot of `pair` starting at byte `offset`, for
    /// callers that address the slot with an offset carried off the wire.
    pub fn write_primary_at(&self, pair: &PairDesc, offset: usize, data: &[u8]) {
        let mut guard = self.inner.lock().unwrap();
        let start = pair.primary_offset + offset;
        guard.base[start..start + data.len()].copy_from_slice(data);
    }

    /// Reads back the primary slot of `pair`, up to `len` bytes.
    pub fn read_primary(&self, pair: &PairDesc, len: usize) -> Vec<u8> {
        let guard = self.inner.lock().unwrap();
        let start = pair.primary_offset;
        guard.base[start..start + len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_partitions_into_num_pairs() {
        let pool = BufferPool::new(4, (PAGE_SIZE, PAGE_SIZE)).unwrap();
        assert_eq!(pool.num_pairs(), 4);
    }

    #[test]
    fn acquire_then_release_recycles_pair() {
        let pool = BufferPool::new(1, (PAGE_SIZE, PAGE_SIZE)).unwrap();
        let pair = pool.acquire();
        assert!(pool.try_acquire().is_none());
        pool.release(pair.id);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn undersized_pair_is_rejected_at_init() {
        assert_eq!(BufferPool::new(1, (8, 8)).err(), Some(PoolError::InvalidPairSize));
    }

    #[test]
    fn write_then_read_primary_round_trips() {
        let pool = BufferPool::new(1, (PAGE_SIZE, PAGE_SIZE)).unwrap();
        let pair = pool.acquire();
        let pattern: Vec<u8> = (0..256).map(|i| (i % 251) as u8).collect();
        pool.write_primary(&pair, &pattern);
        assert_eq!(pool.read_primary(&pair, pattern.len()), pattern);
    }
}
