//! Legacy TCP-based OOB exchange (spec §4.3). Grounded on
//! `examples/original_source/src/io/bmi/bmi_ib/ib.c`'s
//! `ib_tcp_server_accept_thread`/`ib_tcp_client_connect`: a dedicated
//! accept thread polls the listen socket with a timeout, spawns a
//! short-lived handler thread per incoming connection, and that thread
//! exchanges queue-pair bring-up parameters over the raw socket before
//! transitioning the QP to RTR/RTS.
//!
//! Unlike the RDMA-CM backend, there is no CM event channel driving
//! address resolution here — the two sides just swap LID/QPN/PSN over
//! `TcpStream` and bring the QP up directly.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::backend::{CompletionEvent, CompletionQueueOps, QueuePairOps, WcOpcode};
use crate::error::{BmiError, Result};
use crate::memcache::{RegionKeys, Registrar};

const MAX_QP_WR: usize = 4096;
const MAX_CQ_ELEMENTS: usize = 64;
const MAX_ACCEPT_BACKOFF_MS: u64 = 2000;

/// Local queue-pair bring-up parameters exchanged with the peer, mirroring
/// `ib.c`'s LID/QPN/PSN handshake.
#[derive(Debug, Clone, Copy)]
struct QpExchangeInfo {
    lid: u16,
    qpn: u32,
    psn: u32,
}

impl QpExchangeInfo {
    fn write_to(&self, stream: &mut TcpStream) -> Result<()> {
        stream.write_u16::<LittleEndian>(self.lid)?;
        stream.write_u32::<LittleEndian>(self.qpn)?;
        stream.write_u32::<LittleEndian>(self.psn)?;
        Ok(())
    }

    fn read_from(stream: &mut TcpStream) -> Result<Self> {
        let lid = stream.read_u16::<LittleEndian>()?;
        let qpn = stream.read_u32::<LittleEndian>()?;
        let psn = stream.read_u32::<LittleEndian>()?;
        Ok(QpExchangeInfo { lid, qpn, psn })
    }
}

/// Everything a freshly brought-up TCP-backend connection hands back.
pub struct TcpBringup {
    pub pd: rdma_cm::ProtectionDomain,
    pub cq: rdma_cm::CompletionQueue<MAX_CQ_ELEMENTS>,
    pub qp: rdma_cm::QueuePair<MAX_QP_WR, MAX_QP_WR>,
    pub peername: String,
}

/// Listens for incoming TCP handshakes and brings up one QP per accepted
/// socket. `accept_timeout_ms` bounds the `poll`-equivalent wait per spec
/// §6's `accept_timeout_ms` tunable; listen/accept errors are retried with
/// capped backoff per spec §4.6, never corrupting existing connections.
pub struct TcpOobListener {
    listener: TcpListener,
    device: rdma_cm::CommunicationManager<true>,
    accept_timeout_ms: u64,
}

impl TcpOobListener {
    pub fn bind(addr: &str, backlog: usize, accept_timeout_ms: u64) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let _ = backlog; // std's TcpListener::bind has no separate backlog knob; OS default applies.
        let device = rdma_cm::CommunicationManager::new()
            .map_err(|_| BmiError::Peer("failed to open verbs device context".into()))?;
        Ok(TcpOobListener {
            listener,
            device,
            accept_timeout_ms,
        })
    }

    /// One iteration of the accept loop: try once, backing off on
    /// transient failure. Returns `Ok(None)` on a clean timeout (no
    /// pending connection), matching spec §4.3's non-corrupting retry.
    pub fn accept_one(&mut self, backoff_ms: &mut u64) -> Result<Option<TcpBringup>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                *backoff_ms = 0;
                self.handshake_server(stream, peer.to_string())
                    .map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(self.accept_timeout_ms));
                Ok(None)
            }
            Err(e) => {
                let wait = (*backoff_ms).max(1);
                warn!("accept error, backing off {}ms: {}", wait, e);
                std::thread::sleep(Duration::from_millis(wait));
                *backoff_ms = (*backoff_ms * 2 + 1).min(MAX_ACCEPT_BACKOFF_MS);
                Ok(None)
            }
        }
    }

    fn handshake_server(&mut self, mut stream: TcpStream, peername: String) -> Result<TcpBringup> {
        debug!("accepted TCP OOB handshake from {}", peername);
        let pd = self
            .device
            .allocate_protection_domain()
            .map_err(|_| BmiError::Resource("protection domain allocation failed".into()))?;
        let cq = self
            .device
            .create_cq()
            .map_err(|_| BmiError::Resource("CQ allocation failed".into()))?;
        let qp = self.device.create_qp(&pd, &cq);

        let local = QpExchangeInfo {
            lid: qp.local_lid(),
            qpn: qp.qp_num(),
            psn: qp.local_psn(),
        };
        let remote = QpExchangeInfo::read_from(&mut stream)?;
        local.write_to(&mut stream)?;

        qp.modify_to_init()
            .and_then(|_| qp.modify_to_rtr(remote.lid, remote.qpn, remote.psn))
            .and_then(|_| qp.modify_to_rts(local.psn))
            .map_err(|_| BmiError::Peer("QP bring-up (server) failed".into()))?;

        Ok(TcpBringup {
            pd,
            cq,
            qp,
            peername,
        })
    }
}

/// Client-side connect: resolve `host:port`, dial, and mirror the
/// handshake (`ib_tcp_client_connect`).
pub fn connect(host: &str, port: u16) -> Result<TcpBringup> {
    let mut stream = TcpStream::connect((host, port))?;
    let peername = format!("{host}:{port}");

    let device = rdma_cm::CommunicationManager::<true>::new()
        .map_err(|_| BmiError::Peer("failed to open verbs device context".into()))?;
    let pd = device
        .allocate_protection_domain()
        .map_err(|_| BmiError::Resource("protection domain allocation failed".into()))?;
    let cq = device
        .create_cq()
        .map_err(|_| BmiError::Resource("CQ allocation failed".into()))?;
    let qp = device.create_qp(&pd, &cq);

    let local = QpExchangeInfo {
        lid: qp.local_lid(),
        qpn: qp.qp_num(),
        psn: qp.local_psn(),
    };
    local.write_to(&mut stream)?;
    let remote = QpExchangeInfo::read_from(&mut stream)?;

    qp.modify_to_init()
        .and_then(|_| qp.modify_to_rtr(remote.lid, remote.qpn, remote.psn))
        .and_then(|_| qp.modify_to_rts(local.psn))
        .map_err(|_| BmiError::Peer("QP bring-up (client) failed".into()))?;

    Ok(TcpBringup {
        pd,
        cq,
        qp,
        peername,
    })
}

/// [`QueuePairOps`] over a TCP-backend queue pair — same verb operations
/// as the RDMA-CM backend; only bring-up differs.
pub struct TcpQueuePair {
    qp: rdma_cm::QueuePair<MAX_QP_WR, MAX_QP_WR>,
}

impl TcpQueuePair {
    pub fn new(qp: rdma_cm::QueuePair<MAX_QP_WR, MAX_QP_WR>) -> Self {
        TcpQueuePair { qp }
    }
}

impl std::fmt::Debug for TcpQueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpQueuePair").finish()
    }
}

impl QueuePairOps for TcpQueuePair {
    fn post_send(&mut self, wr_id: u64, addr: usize, len: usize, lkey: u32, signaled: bool) -> Result<()> {
        self.qp
            .post_send_raw(wr_id, addr as u64, len as u32, lkey, signaled)
            .map_err(|_| BmiError::Peer("post_send failed".into()))
    }

    fn post_recv(&mut self, wr_id: u64, addr: usize, len: usize, lkey: u32) -> Result<()> {
        self.qp
            .post_recv_raw(wr_id, addr as u64, len as u32, lkey)
            .map_err(|_| BmiError::Peer("post_recv failed".into()))
    }

    fn post_rdma_write(
        &mut self,
        wr_id: u64,
        local_addr: usize,
        local_len: usize,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        signaled: bool,
    ) -> Result<()> {
        self.qp
            .post_rdma_write_raw(
                wr_id,
                local_addr as u64,
                local_len as u32,
                lkey,
                remote_addr,
                rkey,
                signaled,
            )
            .map_err(|_| BmiError::Peer("post_rdma_write failed".into()))
    }

    fn disconnect(&mut self) -> Result<()> {
        self.qp
            .disconnect()
            .map_err(|_| BmiError::Peer("QP disconnect failed".into()))
    }
}

pub struct TcpCompletionQueue {
    cq: rdma_cm::CompletionQueue<MAX_CQ_ELEMENTS>,
}

impl TcpCompletionQueue {
    pub fn new(cq: rdma_cm::CompletionQueue<MAX_CQ_ELEMENTS>) -> Self {
        TcpCompletionQueue { cq }
    }
}

impl CompletionQueueOps for TcpCompletionQueue {
    fn poll(&mut self, max: usize) -> Vec<CompletionEvent> {
        let Some(entries) = self.cq.poll() else {
            return Vec::new();
        };
        entries
            .into_iter()
            .take(max)
            .filter_map(|wc| {
                let opcode = match wc.opcode {
                    o if o == rdma_cm::ffi::ibv_wc_opcode_IBV_WC_SEND => WcOpcode::Send,
                    o if o == rdma_cm::ffi::ibv_wc_opcode_IBV_WC_RECV => WcOpcode::Recv,
                    o if o == rdma_cm::ffi::ibv_wc_opcode_IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
                    _ => return None,
                };
                Some(CompletionEvent {
                    wr_id: wc.wr_id,
                    opcode,
                    byte_len: wc.byte_len,
                    ok: wc.status == rdma_cm::ffi::ibv_wc_status_IBV_WC_SUCCESS,
                })
            })
            .collect()
    }
}

pub struct TcpRegistrar {
    pd: rdma_cm::ProtectionDomain,
}

impl TcpRegistrar {
    pub fn new(pd: rdma_cm::ProtectionDomain) -> Self {
        TcpRegistrar { pd }
    }
}

impl Registrar for TcpRegistrar {
    fn register(&mut self, addr: usize, len: usize) -> Result<RegionKeys> {
        let mr = self
            .pd
            .reg_mr(addr as *mut u8, len)
            .map_err(|_| BmiError::Resource(format!("mr registration failed for {len} bytes")))?;
        Ok(RegionKeys {
            lkey: mr.lkey,
            rkey: mr.rkey,
        })
    }

    fn deregister(&mut self, addr: usize, _len: usize) {
        self.pd.dereg_mr(addr as *mut u8);
    }
}
