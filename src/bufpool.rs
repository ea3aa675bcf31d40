//! Per-connection pool of eager send/recv buffers ("buf-heads"): a bounded
//! MPSC resource (spec §2, §3). Backed by one contiguous, registered
//! allocation per pool so the whole pool is a single memory-cache entry.

use async_channel::{Receiver, Sender, TryRecvError};
use hashbrown::HashSet;

use crate::error::{BmiError, Result};
use crate::workitem::OpId;

/// One pool slot. Invariant: a `BufHead` is on exactly one of
/// {free-list, in-flight} at any time — enforced by [`BufPool`], which is
/// the only thing that constructs or recycles one.
#[derive(Debug, Clone, Copy)]
pub struct BufHead {
    pub index: usize,
    /// Absolute address of this slot's storage, for wiring into a
    /// scatter/gather entry or a CTS segment.
    pub addr: usize,
    pub len: usize,
    /// Work item this buf-head is currently servicing, for completion
    /// dispatch back to the right send/recv state machine.
    pub owner: Option<OpId>,
}

/// A bounded pool of `capacity` buffers of `buf_size` bytes apiece, backed
/// by one contiguous allocation (the registration unit for the pool's
/// memory region).
pub struct BufPool {
    buf_size: usize,
    storage: Vec<u8>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    in_flight: HashSet<usize>,
}

impl BufPool {
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        let (free_tx, free_rx) = async_channel::bounded(capacity);
        for idx in 0..capacity {
            free_tx.try_send(idx).expect("pool channel sized to capacity");
        }
        BufPool {
            buf_size,
            storage: vec![0u8; capacity * buf_size],
            free_tx,
            free_rx,
            in_flight: HashSet::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len() / self.buf_size.max(1)
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Base address of the pool's backing storage — what gets registered
    /// with the memory cache as a single region.
    pub fn base_addr(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    pub fn total_len(&self) -> usize {
        self.storage.len()
    }

    /// Non-blocking acquire, for the protocol engine's "dequeue a
    /// send-BufHead (consumes one send-credit)" step. Returns `None` if
    /// the pool is momentarily exhausted — the caller stalls in
    /// `WaitingBuffer`.
    pub fn try_acquire(&mut self) -> Option<BufHead> {
        let idx = match self.free_rx.try_recv() {
            Ok(idx) => idx,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => unreachable!("pool channel is never closed"),
        };
        self.in_flight.insert(idx);
        Some(BufHead {
            index: idx,
            addr: self.base_addr() + idx * self.buf_size,
            len: self.buf_size,
            owner: None,
        })
    }

    /// Return a buf-head to the free-list. The completion handler calls
    /// this once a SEND/RECV completes and the slot's data has been
    /// consumed or reposted.
    pub fn release(&mut self, bh: BufHead) -> Result<()> {
        if !self.in_flight.remove(&bh.index) {
            return Err(BmiError::Protocol(format!(
                "buf-head {} released while not in-flight",
                bh.index
            )));
        }
        self.free_tx
            .try_send(bh.index)
            .map_err(|_| BmiError::Resource("buf-head free-list unexpectedly full".into()))
    }

    pub fn free_count(&self) -> usize {
        self.free_rx.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn slice(&self, bh: &BufHead) -> &[u8] {
        &self.storage[bh.index * self.buf_size..(bh.index + 1) * self.buf_size]
    }

    pub fn slice_mut(&mut self, bh: &BufHead) -> &mut [u8] {
        let start = bh.index * self.buf_size;
        &mut self.storage[start..start + self.buf_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_drains_exactly_capacity_then_stalls() {
        let mut pool = BufPool::new(4, 64);
        let mut heads = Vec::new();
        for _ in 0..4 {
            heads.push(pool.try_acquire().expect("should have free buffer"));
        }
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.in_flight_count(), 4);
    }

    #[test]
    fn release_makes_the_slot_reacquirable() {
        let mut pool = BufPool::new(1, 64);
        let bh = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        pool.release(bh).unwrap();
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn releasing_a_slot_twice_is_rejected() {
        let mut pool = BufPool::new(1, 64);
        let bh = pool.try_acquire().unwrap();
        pool.release(bh).unwrap();
        assert!(pool.release(bh).is_err());
    }

    #[test]
    fn slices_are_disjoint_per_index() {
        let mut pool = BufPool::new(2, 8);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        pool.slice_mut(&a)[0] = 1;
        pool.slice_mut(&b)[0] = 2;
        assert_eq!(pool.slice(&a)[0], 1);
        assert_eq!(pool.slice(&b)[0], 2);
    }
}
