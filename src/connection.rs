//! One reliable queue pair to a peer (spec §3 "Connection"), and the
//! directory of peers → queue pairs (spec §2 "ConnectionTable").

use crate::addr::{AddrId, ConnHandle};
use crate::backend::{CompletionQueueOps, QueuePairOps};
use crate::bufpool::BufPool;
use crate::memcache::{MemCache, RegionKeys, Registrar};

/// One unit of `send_credit` is never handed out for ordinary sends; it is
/// kept in reserve so a `CREDIT` message can always be emitted even when
/// the connection is otherwise fully drained (spec §4.1, SPEC_FULL §C.3).
pub const RESERVED_CREDIT: i64 = 1;

pub struct Connection {
    /// Back-reference to this connection's peer descriptor. Non-owning:
    /// the [`crate::addr::AddressTable`] owns the `PeerAddress`.
    pub peer: AddrId,
    pub peername: String,

    pub send_credit: i64,
    pub return_credit: u32,

    /// Work items currently referring to this connection.
    pub refcount: usize,
    pub cancelled: bool,
    pub closed: bool,

    pub send_pool: BufPool,
    pub recv_pool: BufPool,
    pub send_region: Option<RegionKeys>,
    pub recv_region: Option<RegionKeys>,

    pub mem_cache: MemCache,

    pub qp: Box<dyn QueuePairOps>,
    /// This connection's own completion queue — the teacher's backend
    /// hands one out per queue pair at bring-up time rather than sharing
    /// one CQ across connections, so the poller polls it here instead of
    /// through a separately threaded-in handle.
    pub cq: Box<dyn CompletionQueueOps>,
    pub registrar: Box<dyn Registrar>,

    /// Unsignaled-send bookkeeping (spec §4.2): force a signaled send
    /// every `max_unsignaled_sends - 10` posts so the CQ cannot fill.
    pub max_unsignaled_sends: u32,
    pub num_unsignaled_sends: u32,
}

impl Connection {
    pub fn new(
        peer: AddrId,
        peername: String,
        eager_buf_num: usize,
        eager_buf_size: usize,
        qp: Box<dyn QueuePairOps>,
        cq: Box<dyn CompletionQueueOps>,
        registrar: Box<dyn Registrar>,
        max_unsignaled_sends: u32,
    ) -> Self {
        Connection {
            peer,
            peername,
            // One credit held in reserve; see RESERVED_CREDIT.
            send_credit: eager_buf_num as i64 - RESERVED_CREDIT,
            return_credit: 0,
            refcount: 0,
            cancelled: false,
            closed: false,
            send_pool: BufPool::new(eager_buf_num, eager_buf_size),
            recv_pool: BufPool::new(eager_buf_num, eager_buf_size),
            send_region: None,
            recv_region: None,
            mem_cache: MemCache::new(),
            qp,
            cq,
            registrar,
            max_unsignaled_sends,
            num_unsignaled_sends: 0,
        }
    }

    /// Whether this send should be posted with the completion-signaled
    /// flag, per the "signal every max-10" contract.
    pub fn should_signal_send(&mut self) -> bool {
        self.num_unsignaled_sends += 1;
        if self.max_unsignaled_sends > 10
            && self.num_unsignaled_sends + 10 >= self.max_unsignaled_sends
        {
            self.num_unsignaled_sends = 0;
            true
        } else {
            false
        }
    }

    /// Consume one send credit if available (spec §4.1 credit flow).
    pub fn try_take_send_credit(&mut self) -> bool {
        if self.send_credit > 0 {
            self.send_credit -= 1;
            true
        } else {
            false
        }
    }

    /// Piggyback-and-zero the connection's owed return credit onto an
    /// outgoing message header.
    pub fn take_return_credit(&mut self) -> u32 {
        let c = self.return_credit;
        self.return_credit = 0;
        c
    }

    /// A completed inbound message adds `n` credits to what we can send.
    pub fn add_send_credit(&mut self, n: u32) {
        self.send_credit += n as i64;
    }

    /// A recv buffer was consumed; we owe the peer a credit back. Returns
    /// `true` if an explicit `CREDIT` message must be sent now because the
    /// owed count is approaching the pool size (spec §4.1).
    pub fn note_recv_consumed(&mut self, eager_buf_num: usize) -> bool {
        self.return_credit += 1;
        if self.return_credit as usize > eager_buf_num.saturating_sub(4) {
            // One reserved credit, not subject to the normal check.
            self.send_credit -= 1;
            true
        } else {
            false
        }
    }

    pub fn is_freeable(&self) -> bool {
        self.refcount == 0 && (self.closed || self.cancelled)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peername", &self.peername)
            .field("send_credit", &self.send_credit)
            .field("return_credit", &self.return_credit)
            .field("refcount", &self.refcount)
            .field("cancelled", &self.cancelled)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Directory of peers → queue pairs. Owns every live [`Connection`].
#[derive(Default)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        ConnectionTable::default()
    }

    pub fn insert(&mut self, conn: Connection) -> ConnHandle {
        let idx = self.slots.len();
        self.slots.push(Some(conn));
        ConnHandle(idx)
    }

    pub fn get(&self, h: ConnHandle) -> Option<&Connection> {
        self.slots.get(h.0)?.as_ref()
    }

    pub fn get_mut(&mut self, h: ConnHandle) -> Option<&mut Connection> {
        self.slots.get_mut(h.0)?.as_mut()
    }

    /// Drop a connection if it is freeable; proves the §8 invariant
    /// "refcount=0 and closed => freed exactly once" by taking the slot.
    pub fn reap_if_freeable(&mut self, h: ConnHandle) -> bool {
        let freeable = self.get(h).map(Connection::is_freeable).unwrap_or(false);
        if freeable {
            self.slots[h.0] = None;
        }
        freeable
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnHandle, &mut Connection)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, c)| c.as_mut().map(|c| (ConnHandle(i), c)))
    }

    pub fn len_live(&self) -> usize {
        self.slots.iter().filter(|c| c.is_some()).count()
    }
}
