//! The process-wide transport device (spec §9 "Global state → device
//! object", §4.5 "BMI Facade"). One `BmiDevice` is created per process by
//! `BmiDevice::init`; everything else — connections, pools, work items —
//! hangs off it through non-owning handles, replacing the original's
//! process-wide pointer with hidden linkage.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{info, instrument};

use crate::addr::{AddrId, AddressTable, ConnHandle};
use crate::backend::rdma_cm::RdmaCmConnector;
use crate::backend::tcp::TcpOobListener;
use crate::config::Tunables;
use crate::connection::{Connection, ConnectionTable};
use crate::error::{BmiError, Result};
use crate::memcache::RegistrationMode;
use crate::poller::{Completion, Poller};
use crate::protocol;
use crate::unexpected::{UnexpectedMessage, UnexpectedQueue};
use crate::workitem::{Buflist, OpDirectory, OpId, RecvState, SendState, WorkItem};

/// Which OOB setup variant a device brings connections up with (spec §4.3,
/// §9 "Two back-ends"). Chosen once at init; see SPEC_FULL §D for the
/// default (`RdmaCm`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    RdmaCm,
    Tcp,
}

/// Runtime knobs reachable through `get_info`/`set_info` (spec §6
/// transport-operations table; opcodes grounded on `BMI_rdma_get_info`/
/// `BMI_rdma_set_info`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKey {
    EagerPayloadMax,
    ConnectionCount,
    RegistrationMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoValue {
    Usize(usize),
    Mode(RegistrationMode),
}

/// The one process-wide transport object. Owns every connection, op
/// directory, and the unexpected-message queue; nothing else in the crate
/// holds these directly.
pub struct BmiDevice {
    tunables: Tunables,
    registration_mode: RegistrationMode,
    backend_kind: BackendKind,
    addrs: AddressTable,
    conns: ConnectionTable,
    opdirs: HashMap<ConnHandle, OpDirectory>,
    unexpected: UnexpectedQueue,
    rdma_cm: Option<RdmaCmConnector>,
    tcp_listener: Option<TcpOobListener>,
    tcp_backoff_ms: u64,
    /// Counter for synthesizing a unique `host:port` key for RDMA-CM
    /// accepted connections, which carry no resolvable peer URL of their
    /// own (spec §3's dedup key is `(host, port)`; an inbound accept has
    /// neither until the caller looks it up by `rev_lookup`).
    next_inbound_id: u64,
}

impl BmiDevice {
    /// `BMI_initialize`-equivalent: construct the device under an implicit
    /// init mutex (the caller's single ownership of the returned value
    /// stands in for it — see SPEC_FULL §B.3).
    #[instrument(skip_all)]
    pub fn init(tunables: Tunables, backend_kind: BackendKind) -> Result<Self> {
        let rdma_cm = match backend_kind {
            BackendKind::RdmaCm => Some(RdmaCmConnector::new()?),
            BackendKind::Tcp => None,
        };
        info!(?backend_kind, "BMI device initialized");
        Ok(BmiDevice {
            tunables,
            registration_mode: RegistrationMode::EarlyReg,
            backend_kind,
            addrs: AddressTable::new(),
            conns: ConnectionTable::new(),
            opdirs: HashMap::new(),
            unexpected: UnexpectedQueue::new(),
            rdma_cm,
            tcp_listener: None,
            tcp_backoff_ms: 0,
            next_inbound_id: 0,
        })
    }

    /// Bind and listen on `addr`, for whichever backend this device was
    /// initialized with (spec §4.3).
    pub fn listen(&mut self, addr: SocketAddr) -> Result<()> {
        match self.backend_kind {
            BackendKind::RdmaCm => {
                let cm = self.rdma_cm.as_mut().expect("RdmaCm backend missing connector");
                cm.bind(addr)?;
                cm.listen()
            }
            BackendKind::Tcp => {
                let listener = TcpOobListener::bind(
                    &addr.to_string(),
                    self.tunables.listen_backlog,
                    self.tunables.accept_timeout_ms,
                )?;
                self.tcp_listener = Some(listener);
                Ok(())
            }
        }
    }

    /// Block for one incoming connection and bring it fully up — protection
    /// domain, CQ, QP, registered pools, pre-posted recvs — before
    /// returning (spec §4.3 "MUST complete... before the first user
    /// message is posted").
    #[instrument(skip(self))]
    pub fn accept(&mut self) -> Result<AddrId> {
        match self.backend_kind {
            BackendKind::RdmaCm => {
                let cm = self.rdma_cm.as_mut().expect("RdmaCm backend missing connector");
                let bringup = cm.accept()?;
                self.next_inbound_id += 1;
                let peername = format!("accepted-{}:0", self.next_inbound_id);
                self.finish_rdma_cm_bringup(peername, bringup)
            }
            BackendKind::Tcp => loop {
                let listener = self.tcp_listener.as_mut().expect("Tcp backend not listening");
                if let Some(bringup) = listener.accept_one(&mut self.tcp_backoff_ms)? {
                    return self.finish_tcp_bringup(bringup);
                }
            },
        }
    }

    fn finish_rdma_cm_bringup(
        &mut self,
        peername: String,
        bringup: crate::backend::rdma_cm::RdmaCmBringup,
    ) -> Result<AddrId> {
        let qp = Box::new(crate::backend::rdma_cm::RdmaCmQueuePair::new(bringup.qp));
        let cq = Box::new(crate::backend::rdma_cm::RdmaCmCompletionQueue::new(bringup.cq));
        let registrar = Box::new(crate::backend::rdma_cm::RdmaCmRegistrar::new(bringup.pd));
        self.finish_bringup(peername, qp, cq, registrar)
    }

    fn finish_tcp_bringup(&mut self, bringup: crate::backend::tcp::TcpBringup) -> Result<AddrId> {
        let peername = bringup.peername.clone();
        let qp = Box::new(crate::backend::tcp::TcpQueuePair::new(bringup.qp));
        let cq = Box::new(crate::backend::tcp::TcpCompletionQueue::new(bringup.cq));
        let registrar = Box::new(crate::backend::tcp::TcpRegistrar::new(bringup.pd));
        self.finish_bringup(peername, qp, cq, registrar)
    }

    fn finish_bringup(
        &mut self,
        peername: String,
        qp: Box<dyn crate::backend::QueuePairOps>,
        cq: Box<dyn crate::backend::CompletionQueueOps>,
        registrar: Box<dyn crate::memcache::Registrar>,
    ) -> Result<AddrId> {
        let scheme = match self.backend_kind {
            BackendKind::RdmaCm => "rdma",
            BackendKind::Tcp => "ib",
        };
        let url = format!("{scheme}://{peername}");
        let addr_id = self.addrs.lookup_or_insert(&url)?;

        let conn = Connection::new(
            addr_id,
            peername,
            self.tunables.eager_buf_num,
            self.tunables.eager_buf_size,
            qp,
            cq,
            registrar,
            4096,
        );
        let handle = self.conns.insert(conn);
        self.opdirs.insert(handle, OpDirectory::new());

        if let Some(a) = self.addrs.get_mut(addr_id) {
            a.conn = Some(handle);
        }

        // Pre-post the entire recv pool before the first message can arrive.
        self.pre_post_recv_pool(handle)?;
        info!(%addr_id.0, "connection established");
        Ok(addr_id)
    }

    fn pre_post_recv_pool(&mut self, handle: ConnHandle) -> Result<()> {
        let conn = self
            .conns
            .get_mut(handle)
            .ok_or_else(|| BmiError::Protocol("pre-post on missing connection".into()))?;
        let keys = conn
            .mem_cache
            .register(&mut *conn.registrar, conn.recv_pool.base_addr(), conn.recv_pool.total_len())?;
        conn.recv_region = Some(keys);
        for idx in 0..conn.recv_pool.capacity() {
            let addr = conn.recv_pool.base_addr() + idx * conn.recv_pool.buf_size();
            conn.qp.post_recv(idx as u64, addr, conn.recv_pool.buf_size(), keys.lkey)?;
        }
        let send_keys = conn
            .mem_cache
            .register(&mut *conn.registrar, conn.send_pool.base_addr(), conn.send_pool.total_len())?;
        conn.send_region = Some(send_keys);
        Ok(())
    }

    /// `post_send`/`post_sendunexpected`/connect-on-demand (spec §4.3,
    /// §4.5). `reconnect` drives synchronous client setup when `url` is
    /// not yet connected.
    #[instrument(skip(self))]
    pub fn connect(&mut self, url: &str, reconnect: bool) -> Result<AddrId> {
        let addr_id = self.addrs.lookup_or_insert(url)?;
        if self.addrs.get(addr_id).map(|a| a.is_connected()).unwrap_or(false) {
            return Ok(addr_id);
        }
        if !reconnect {
            return Err(BmiError::NotConnected);
        }

        let (host, port) = {
            let a = self.addrs.get(addr_id).expect("just inserted");
            (a.host.clone(), a.port)
        };

        match self.backend_kind {
            BackendKind::RdmaCm => {
                let cm = self.rdma_cm.as_mut().expect("RdmaCm backend missing connector");
                let bringup = cm.connect(&host, &port.to_string())?;
                self.finish_rdma_cm_bringup(format!("{host}:{port}"), bringup)
            }
            BackendKind::Tcp => {
                let bringup = crate::backend::tcp::connect(&host, port)?;
                self.finish_tcp_bringup(bringup)
            }
        }
    }

    fn conn_handle_of(&self, peer: AddrId) -> Result<ConnHandle> {
        self.addrs
            .get(peer)
            .and_then(|a| a.conn)
            .ok_or(BmiError::NotConnected)
    }

    pub fn post_send(
        &mut self,
        peer: AddrId,
        buflist: Buflist,
        total_len: usize,
        tag: u32,
        user_ptr: u64,
    ) -> Result<OpId> {
        self.post_send_inner(peer, buflist, total_len, tag, false, user_ptr)
    }

    pub fn post_sendunexpected(
        &mut self,
        peer: AddrId,
        buflist: Buflist,
        total_len: usize,
        tag: u32,
        user_ptr: u64,
    ) -> Result<OpId> {
        self.post_send_inner(peer, buflist, total_len, tag, true, user_ptr)
    }

    fn post_send_inner(
        &mut self,
        peer: AddrId,
        buflist: Buflist,
        total_len: usize,
        tag: u32,
        unexpected: bool,
        user_ptr: u64,
    ) -> Result<OpId> {
        let handle = self.conn_handle_of(peer)?;
        let opdir = self
            .opdirs
            .get_mut(&handle)
            .ok_or_else(|| BmiError::Protocol("missing op directory for connection".into()))?;
        let id = protocol::submit_send(opdir, &self.tunables, buflist, total_len, tag, unexpected, user_ptr)?;
        if let Some(conn) = self.conns.get_mut(handle) {
            protocol::drain_waiting_sends(conn, opdir, &self.tunables)?;
        }
        Ok(id)
    }

    pub fn post_recv(
        &mut self,
        peer: AddrId,
        buflist: Buflist,
        tag: u32,
        user_ptr: u64,
    ) -> Result<OpId> {
        let handle = self.conn_handle_of(peer)?;
        let opdir = self
            .opdirs
            .get_mut(&handle)
            .ok_or_else(|| BmiError::Protocol("missing op directory for connection".into()))?;
        Ok(protocol::submit_recv(opdir, buflist, tag, user_ptr))
    }

    /// Reap exactly one completion for `op_id`, polling until it appears or
    /// `timeout` elapses (spec §4.5 `test`).
    pub fn test(&mut self, op_id: OpId, timeout: Duration) -> Result<Option<Completion>> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.tick();
            if let Some(pos) = batch.iter().position(|c| c.op_id == op_id) {
                return Ok(Some(batch[pos]));
            }
            if !self.op_still_pending(op_id) {
                // Already reaped by an earlier tick this call never saw,
                // or never existed — caller's problem either way.
                return Ok(None);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Reap up to `incount` completions across every connection (spec §4.5
    /// `testcontext`).
    pub fn testcontext(&mut self, incount: usize, timeout: Duration) -> Vec<Completion> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        loop {
            out.extend(self.tick());
            if out.len() >= incount || Instant::now() >= deadline {
                out.truncate(incount);
                return out;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Reap up to `incount` arrived-before-posted records (spec §4.5
    /// `testunexpected`).
    pub fn testunexpected(&mut self, incount: usize, timeout: Duration) -> Vec<UnexpectedMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick();
            if !self.unexpected.is_empty() || Instant::now() >= deadline {
                return self.unexpected.drain_upto(incount);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn op_still_pending(&self, op_id: OpId) -> bool {
        self.opdirs.values().any(|d| d.contains(op_id))
    }

    fn tick(&mut self) -> Vec<Completion> {
        Poller::tick(&mut self.conns, &mut self.opdirs, &mut self.unexpected, &self.tunables)
    }

    /// `cancel(op_id)` (spec §4.5): idempotent, and forces the connection
    /// closed if the op is mid-rendezvous — an RTS/CTS/RDMA-WRITE already
    /// posted can't be un-posted, so the only safe way to abandon it is to
    /// tear the queue pair down (spec §9's cancel-ordering fix: mark the
    /// item cancelled, then disconnect, never the other order).
    pub fn cancel(&mut self, op_id: OpId) -> Result<()> {
        for (handle, opdir) in self.opdirs.iter_mut() {
            let Some(item) = opdir.get_mut(op_id) else { continue };
            if item.is_terminal() {
                return Ok(());
            }

            let needs_teardown = match item {
                WorkItem::Send(s) => matches!(
                    s.state,
                    SendState::WaitingRtsSendCompletion
                        | SendState::WaitingCts
                        | SendState::WaitingRtsSendCompletionGotCts
                        | SendState::WaitingDataSendCompletion
                        | SendState::WaitingRtsDoneBuffer
                        | SendState::WaitingRtsDoneSendCompletion
                ),
                WorkItem::Recv(r) => r.state.intersects(
                    RecvState::RTS_WAITING_CTS_BUFFER
                        | RecvState::RTS_WAITING_CTS_SEND_COMPLETION
                        | RecvState::RTS_WAITING_RTS_DONE,
                ),
            };

            match item {
                WorkItem::Send(s) => s.state = SendState::Cancelled,
                WorkItem::Recv(r) => r.state = RecvState::CANCELLED,
            }

            if needs_teardown {
                if let Some(conn) = self.conns.get_mut(*handle) {
                    conn.cancelled = true;
                    conn.qp.disconnect()?;
                }
            }
            return Ok(());
        }
        Ok(())
    }

    /// `addr_lookup` (spec §6 transport-operations table).
    pub fn addr_lookup(&mut self, url: &str) -> Result<AddrId> {
        self.addrs.lookup_or_insert(url)
    }

    /// `rev_lookup`: recover a peer's address id from its connection.
    pub fn rev_lookup(&self, handle: ConnHandle) -> Option<AddrId> {
        self.addrs.rev_lookup(handle)
    }

    /// `memalloc`: a MemCache-aligned scratch buffer (spec §4.5, optional
    /// hook). Returned buffers are plain heap allocations — registration
    /// happens lazily the first time the buffer is used in a post, same as
    /// any other user memory.
    pub fn memalloc(&self, len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    pub fn memfree(&self, _buf: Vec<u8>) {}

    /// `get_info` (SPEC_FULL §C.1, grounded on `BMI_rdma_get_info`).
    pub fn get_info(&self, key: InfoKey) -> InfoValue {
        match key {
            InfoKey::EagerPayloadMax => InfoValue::Usize(self.tunables.eager_payload_max()),
            InfoKey::ConnectionCount => InfoValue::Usize(self.conns.len_live()),
            InfoKey::RegistrationMode => InfoValue::Mode(self.registration_mode),
        }
    }

    /// `set_info` (SPEC_FULL §C.1): the only mutable knob is the
    /// registration mode, matching the original's bounce-buffer toggle.
    pub fn set_info(&mut self, mode: RegistrationMode) {
        self.registration_mode = mode;
    }

    /// `finalize`: send BYE on every live connection so the peer can drain
    /// before observing a disconnect event (SPEC_FULL §C.5), then tear
    /// down every queue pair.
    #[instrument(skip(self))]
    pub fn finalize(&mut self) -> Result<()> {
        for (_, conn) in self.conns.iter_mut() {
            let bye = protocol::encode_control(crate::wire::MessageType::Bye, conn.take_return_credit());
            if let Some(bh) = conn.send_pool.try_acquire() {
                conn.send_pool.slice_mut(&bh)[..bye.len()].copy_from_slice(&bye);
                let lkey = conn.send_region.map(|r| r.lkey).unwrap_or(0);
                let _ = conn.qp.post_send(u64::MAX, bh.addr, bye.len(), lkey, true);
            }
            conn.qp.disconnect()?;
            conn.closed = true;
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{FakeCompletionQueue, FakeQueuePair, FakeRegistrar};

    fn device_with_fake_connection(tunables: Tunables) -> (BmiDevice, AddrId) {
        let mut dev = BmiDevice {
            tunables,
            registration_mode: RegistrationMode::EarlyReg,
            backend_kind: BackendKind::Tcp,
            addrs: AddressTable::new(),
            conns: ConnectionTable::new(),
            opdirs: HashMap::new(),
            unexpected: UnexpectedQueue::new(),
            rdma_cm: None,
            tcp_listener: None,
            tcp_backoff_ms: 0,
            next_inbound_id: 0,
        };
        let addr_id = dev.addrs.lookup_or_insert("ib://fakehost:1").unwrap();
        let conn = Connection::new(
            addr_id,
            "fakehost:1".into(),
            tunables.eager_buf_num,
            tunables.eager_buf_size,
            Box::new(FakeQueuePair::default()),
            Box::new(FakeCompletionQueue::default()),
            Box::new(FakeRegistrar::default()),
            4096,
        );
        let handle = dev.conns.insert(conn);
        dev.opdirs.insert(handle, OpDirectory::new());
        dev.addrs.get_mut(addr_id).unwrap().conn = Some(handle);
        (dev, addr_id)
    }

    #[test]
    fn post_send_without_connection_is_not_connected() {
        let mut dev = BmiDevice::init(Tunables::default(), BackendKind::Tcp).unwrap();
        let peer = dev.addr_lookup("ib://nope:1").unwrap();
        let bl = Buflist::new(vec![(0, 4)]);
        assert!(matches!(
            dev.post_send(peer, bl, 4, 1, 0),
            Err(BmiError::NotConnected)
        ));
    }

    #[test]
    fn connect_without_reconnect_flag_fails_fast() {
        let mut dev = BmiDevice::init(Tunables::default(), BackendKind::Tcp).unwrap();
        assert!(matches!(
            dev.connect("ib://nope:1", false),
            Err(BmiError::NotConnected)
        ));
    }

    #[test]
    fn eager_send_then_test_reaps_a_completion() {
        let tunables = Tunables::default();
        let (mut dev, peer) = device_with_fake_connection(tunables);
        let mut src = vec![1u8, 2, 3, 4];
        let bl = Buflist::new(vec![(src.as_mut_ptr() as usize, src.len())]);
        let id = dev.post_send(peer, bl, src.len(), 7, 55).unwrap();

        // Drive the (fake) send completion manually: the poller only
        // advances state from what the backend actually reports.
        let handle = dev.conn_handle_of(peer).unwrap();
        let conn = dev.conns.get_mut(handle).unwrap();
        let mut fake_cq = FakeCompletionQueue::default();
        fake_cq.push(id.0, crate::backend::WcOpcode::Send, 0, true);
        conn.cq = Box::new(fake_cq);

        let completion = dev.test(id, Duration::from_millis(10)).unwrap();
        assert!(completion.is_some());
        assert_eq!(completion.unwrap().user_ptr, 55);
    }

    #[test]
    fn cancel_is_idempotent() {
        let tunables = Tunables::default();
        let (mut dev, peer) = device_with_fake_connection(tunables);
        let mut src = vec![0u8; 4];
        let bl = Buflist::new(vec![(src.as_mut_ptr() as usize, src.len())]);
        let id = dev.post_send(peer, bl, src.len(), 1, 0).unwrap();
        dev.cancel(id).unwrap();
        dev.cancel(id).unwrap();
    }

    #[test]
    fn get_info_reports_eager_payload_max() {
        let tunables = Tunables::default();
        let (dev, _peer) = device_with_fake_connection(tunables);
        assert_eq!(
            dev.get_info(InfoKey::EagerPayloadMax),
            InfoValue::Usize(tunables.eager_payload_max())
        );
    }
}
