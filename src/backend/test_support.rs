//! In-memory fakes of the backend traits, used by unit tests elsewhere in
//! the crate so connection/protocol/poller logic can be exercised without
//! a real verbs device.

use crate::backend::{CompletionEvent, CompletionQueueOps, QueuePairOps, WcOpcode};
use crate::error::Result;
use crate::memcache::{RegionKeys, Registrar};

/// Records posted operations and can be told to hand back completions on
/// the next [`CompletionQueueOps::poll`] via [`FakeCompletionQueue`].
#[derive(Debug, Default)]
pub struct FakeQueuePair {
    pub posted_sends: Vec<(u64, usize, usize, bool)>,
    pub posted_recvs: Vec<(u64, usize, usize)>,
    pub posted_writes: Vec<(u64, usize, usize, u64, u32, bool)>,
    pub disconnected: bool,
    pub fail_next_post: bool,
}

impl QueuePairOps for FakeQueuePair {
    fn post_send(&mut self, wr_id: u64, addr: usize, len: usize, _lkey: u32, signaled: bool) -> Result<()> {
        if self.fail_next_post {
            self.fail_next_post = false;
            return Err(crate::error::BmiError::Peer("fake post_send failure".into()));
        }
        self.posted_sends.push((wr_id, addr, len, signaled));
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64, addr: usize, len: usize, _lkey: u32) -> Result<()> {
        self.posted_recvs.push((wr_id, addr, len));
        Ok(())
    }

    fn post_rdma_write(
        &mut self,
        wr_id: u64,
        local_addr: usize,
        local_len: usize,
        _lkey: u32,
        remote_addr: u64,
        rkey: u32,
        signaled: bool,
    ) -> Result<()> {
        self.posted_writes
            .push((wr_id, local_addr, local_len, remote_addr, rkey, signaled));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.disconnected = true;
        Ok(())
    }
}

/// A completion queue that replays a pre-loaded queue of events, one
/// `poll` drain at a time, FIFO.
#[derive(Debug, Default)]
pub struct FakeCompletionQueue {
    pub pending: std::collections::VecDeque<CompletionEvent>,
}

impl FakeCompletionQueue {
    pub fn push(&mut self, wr_id: u64, opcode: WcOpcode, byte_len: u32, ok: bool) {
        self.pending.push_back(CompletionEvent {
            wr_id,
            opcode,
            byte_len,
            ok,
        });
    }
}

impl CompletionQueueOps for FakeCompletionQueue {
    fn poll(&mut self, max: usize) -> Vec<CompletionEvent> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.pending.pop_front() {
                Some(ev) => out.push(ev),
                None => break,
            }
        }
        out
    }
}

/// Hands out monotonically increasing fake `(lkey, rkey)` pairs; never
/// fails registration.
#[derive(Debug, Default)]
pub struct FakeRegistrar {
    next_key: u32,
    pub registered: Vec<(usize, usize)>,
    pub deregistered: Vec<usize>,
}

impl Registrar for FakeRegistrar {
    fn register(&mut self, addr: usize, len: usize) -> Result<RegionKeys> {
        self.next_key += 1;
        self.registered.push((addr, len));
        Ok(RegionKeys {
            lkey: self.next_key,
            rkey: self.next_key,
        })
    }

    fn deregister(&mut self, addr: usize, _len: usize) {
        self.deregistered.push(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_queue_pair_records_posts() {
        let mut qp = FakeQueuePair::default();
        qp.post_send(1, 0x1000, 64, 7, true).unwrap();
        qp.post_recv(2, 0x2000, 64, 7).unwrap();
        assert_eq!(qp.posted_sends.len(), 1);
        assert_eq!(qp.posted_recvs.len(), 1);
    }

    #[test]
    fn fake_queue_pair_can_fail_once() {
        let mut qp = FakeQueuePair::default();
        qp.fail_next_post = true;
        assert!(qp.post_send(1, 0, 1, 0, false).is_err());
        assert!(qp.post_send(1, 0, 1, 0, false).is_ok());
    }

    #[test]
    fn fake_cq_replays_in_order() {
        let mut cq = FakeCompletionQueue::default();
        cq.push(1, WcOpcode::Send, 0, true);
        cq.push(2, WcOpcode::Recv, 64, true);
        let drained = cq.poll(10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].wr_id, 1);
        assert_eq!(drained[1].wr_id, 2);
    }

    #[test]
    fn fake_registrar_assigns_distinct_keys() {
        let mut r = FakeRegistrar::default();
        let a = r.register(0x1000, 64).unwrap();
        let b = r.register(0x2000, 64).unwrap();
        assert_ne!(a.lkey, b.lkey);
    }
}
