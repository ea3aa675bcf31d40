//! Unexpected-message delivery (spec §4.5 `testunexpected`, §3): an eager
//! send that arrives before any matching recv was posted. Kept as its own
//! FIFO queue rather than synthesized recv work items, mirroring the
//! original's separate unexpected-message list — `test`/`testcontext`
//! never see these records; only `testunexpected` drains them.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::addr::AddrId;

/// One arrived-before-posted message, handed back verbatim to the caller
/// of `testunexpected` (spec §4.5).
#[derive(Debug, Clone)]
pub struct UnexpectedMessage {
    pub peer: AddrId,
    pub tag: u32,
    pub payload: Bytes,
}

/// Global (not per-connection) FIFO of unexpected arrivals — `BMI_testunexpected`
/// has no connection argument, so the facade drains one shared queue.
#[derive(Default)]
pub struct UnexpectedQueue {
    items: VecDeque<UnexpectedMessage>,
}

impl UnexpectedQueue {
    pub fn new() -> Self {
        UnexpectedQueue::default()
    }

    pub fn push(&mut self, msg: UnexpectedMessage) {
        self.items.push_back(msg);
    }

    /// Reap up to `incount` arrivals, oldest first.
    pub fn drain_upto(&mut self, incount: usize) -> Vec<UnexpectedMessage> {
        let n = incount.min(self.items.len());
        self.items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
