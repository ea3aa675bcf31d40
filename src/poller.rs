//! The completion poller (spec §4.2): the single place that drains the
//! completion queue and mutates work-item/connection state. Everything
//! else in the crate only prepares data for the poller to post, or reads
//! state the poller already settled.

use bytes::Bytes;
use tracing::{trace, warn};

use crate::addr::ConnHandle;
use crate::backend::{CompletionEvent, WcOpcode};
use crate::config::Tunables;
use crate::connection::ConnectionTable;
use crate::error::{BmiError, ErrorKind, Result};
use crate::protocol;
use crate::unexpected::UnexpectedQueue;
use crate::workitem::{OpDirectory, OpId, RecvState, SendState, WorkItem};

/// Completions drained in one non-blocking pass (spec §4.2 step 1: "Poll
/// at most K (≈5) completions non-blocking").
pub const POLL_BATCH: usize = 5;

/// A terminal outcome the caller's `test*` entry points can observe.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub op_id: OpId,
    pub status: ErrorKind,
    pub size: usize,
    pub user_ptr: u64,
}

/// Owns nothing; driven with borrowed connection/op-directory state each
/// tick so it composes with whatever executor shape wraps it (this crate
/// does not itself spawn a thread — see `device` for that).
pub struct Poller;

impl Poller {
    /// One full pass over every live connection: drain its own completion
    /// queue, dispatch each event, then drive anything newly unblocked
    /// (waiting sends, pending CTS). Returns completions ready to be
    /// reaped by a `test*` call.
    pub fn tick(
        conns: &mut ConnectionTable,
        opdirs: &mut hashbrown::HashMap<ConnHandle, OpDirectory>,
        unexpected: &mut UnexpectedQueue,
        tunables: &Tunables,
    ) -> Vec<Completion> {
        let mut out = Vec::new();
        let handles: Vec<ConnHandle> = conns.iter_mut().map(|(h, _)| h).collect();

        for h in handles {
            let Some(conn) = conns.get_mut(h) else { continue };
            let events = conn.cq.poll(POLL_BATCH);
            if events.is_empty() {
                continue;
            }
            let Some(opdir) = opdirs.get_mut(&h) else { continue };

            for ev in events {
                if let Err(e) = Self::dispatch(conn, opdir, unexpected, tunables, ev, &mut out) {
                    warn!("connection error during dispatch: {e}");
                    conn.cancelled = true;
                }
            }

            if let Err(e) = protocol::drain_waiting_sends(conn, opdir, tunables) {
                warn!("failed driving waiting sends: {e}");
                conn.cancelled = true;
            }
            if let Err(e) = protocol::drive_cts(conn, opdir) {
                warn!("failed driving CTS: {e}");
                conn.cancelled = true;
            }
            if let Err(e) = protocol::drive_rts_done(conn, opdir) {
                warn!("failed driving RTS_DONE: {e}");
                conn.cancelled = true;
            }

            Self::collect_terminal(opdir, &mut out);
            conns.reap_if_freeable(h);
        }

        out
    }

    fn dispatch(
        conn: &mut crate::connection::Connection,
        opdir: &mut OpDirectory,
        unexpected: &mut UnexpectedQueue,
        _tunables: &Tunables,
        ev: CompletionEvent,
        out: &mut Vec<Completion>,
    ) -> Result<()> {
        if !ev.ok {
            if let Some(item) = opdir.get_mut(OpId(ev.wr_id)) {
                mark_error(item);
            }
            conn.cancelled = true;
            return Err(BmiError::Peer(format!(
                "work completion failed for wr_id {}",
                ev.wr_id
            )));
        }

        match ev.opcode {
            WcOpcode::Recv => {
                // A recv completion's wr_id is the BufHead index that was
                // posted, not an op id; the payload lives in the recv pool
                // slot. Re-post the buffer once the message is consumed.
                let idx = ev.wr_id as usize;
                let slot_addr = conn.recv_pool.base_addr() + idx * conn.recv_pool.buf_size();
                let len = ev.byte_len as usize;
                let bytes = unsafe {
                    Bytes::copy_from_slice(std::slice::from_raw_parts(slot_addr as *const u8, len))
                };
                protocol::on_message_received(conn, opdir, unexpected, bytes)?;
                repost_recv(conn, idx)?;
                trace!("recv completion, {} bytes", len);
            }
            WcOpcode::Send => {
                complete_send_or_cts_recv(conn, opdir, OpId(ev.wr_id), out)?;
            }
            WcOpcode::RdmaWrite => {
                if let Some(WorkItem::Send(item)) = opdir.get_mut(OpId(ev.wr_id)) {
                    item.state = SendState::WaitingRtsDoneBuffer;
                }
            }
        }
        Ok(())
    }

    /// Sweep terminal work items into reaped completions (spec §4.5
    /// `test`/`testcontext` surface reads these back out; this crate's
    /// facade drains `out` into its own pending-completions list).
    /// Unexpected arrivals never reach this directory at all — see
    /// [`crate::unexpected::UnexpectedQueue`] — so every terminal item
    /// found here belongs to a user-posted send or recv.
    fn collect_terminal(opdir: &mut OpDirectory, out: &mut Vec<Completion>) {
        let terminal: Vec<OpId> = opdir
            .iter_mut()
            .filter(|(_, item)| item.is_terminal())
            .map(|(id, _)| *id)
            .collect();

        for id in terminal {
            if let Some(item) = opdir.remove(id) {
                out.push(completion_of(item));
            }
        }
    }
}

fn repost_recv(conn: &mut crate::connection::Connection, idx: usize) -> Result<()> {
    let addr = conn.recv_pool.base_addr() + idx * conn.recv_pool.buf_size();
    let len = conn.recv_pool.buf_size();
    let lkey = conn.recv_region.map(|r| r.lkey).unwrap_or(0);
    conn.qp.post_recv(idx as u64, addr, len, lkey)
}

/// A `SEND, ok` completion advances either a plain send (eager/RTS/
/// RTS_DONE) or — when the signaled send was actually a CTS — the
/// matching recv, per spec §4.2 step 2's shared transition table.
fn complete_send_or_cts_recv(
    conn: &mut crate::connection::Connection,
    opdir: &mut OpDirectory,
    id: OpId,
    out: &mut Vec<Completion>,
) -> Result<()> {
    match opdir.get_mut(id) {
        Some(WorkItem::Send(item)) => {
            item.state = match item.state {
                SendState::WaitingEagerSendCompletion => SendState::WaitingUserTest,
                SendState::WaitingRtsSendCompletion => SendState::WaitingCts,
                SendState::WaitingRtsSendCompletionGotCts => SendState::WaitingDataSendCompletion,
                SendState::WaitingRtsDoneSendCompletion => SendState::WaitingUserTest,
                other => other,
            };
            if let Some(bh) = item.bh.take() {
                conn.send_pool.release(bh)?;
            }
        }
        Some(WorkItem::Recv(r)) => {
            // The CTS send completed; matched by recv mop id equal to wr_id.
            r.state.remove(RecvState::RTS_WAITING_CTS_SEND_COMPLETION);
            if let Some(bh) = r.bh.take() {
                conn.send_pool.release(bh)?;
            }
        }
        None => {}
    }
    let _ = out;
    Ok(())
}

fn mark_error(item: &mut WorkItem) {
    match item {
        WorkItem::Send(s) => s.state = SendState::Error,
        WorkItem::Recv(r) => r.state = RecvState::ERROR,
    }
}

fn completion_of(item: WorkItem) -> Completion {
    match item {
        WorkItem::Send(s) => Completion {
            op_id: s.mop_id,
            status: if s.state == SendState::Error {
                ErrorKind::Peer
            } else if s.state == SendState::Cancelled {
                ErrorKind::Cancelled
            } else {
                ErrorKind::Ok
            },
            size: s.buflist.total_len,
            user_ptr: s.user_ptr,
        },
        WorkItem::Recv(r) => Completion {
            op_id: r.mop_id,
            status: if r.state.contains(RecvState::ERROR) {
                ErrorKind::Peer
            } else if r.state.contains(RecvState::CANCELLED) {
                ErrorKind::Cancelled
            } else {
                ErrorKind::Ok
            },
            size: r.actual_len,
            user_ptr: r.user_ptr,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AddrId;
    use crate::backend::test_support::{FakeCompletionQueue, FakeQueuePair, FakeRegistrar};
    use crate::connection::Connection;
    use crate::workitem::{Buflist, SendItem};

    fn fresh_connection() -> Connection {
        Connection::new(
            AddrId(0),
            "peer".into(),
            4,
            256,
            Box::new(FakeQueuePair::default()),
            Box::new(FakeCompletionQueue::default()),
            Box::new(FakeRegistrar::default()),
            0,
        )
    }

    #[test]
    fn send_completion_frees_buffer_and_advances_state() {
        let mut conns = ConnectionTable::new();
        let mut opdirs = hashbrown::HashMap::new();
        let tunables = Tunables::default();

        let mut conn = fresh_connection();
        let bh = conn.send_pool.try_acquire().unwrap();
        let mut opdir = OpDirectory::new();
        let id = opdir.insert(|mop_id| {
            WorkItem::Send(SendItem {
                state: SendState::WaitingEagerSendCompletion,
                buflist: Buflist::new(vec![(0, 4)]),
                tag: 1,
                mop_id,
                is_unexpected: false,
                bh: Some(bh),
                user_ptr: 99,
            })
        });
        let mut cq = FakeCompletionQueue::default();
        cq.push(id.0, WcOpcode::Send, 0, true);
        conn.cq = Box::new(cq);

        let h = conns.insert(conn);
        opdirs.insert(h, opdir);
        let mut unexpected = UnexpectedQueue::new();

        let completions = Poller::tick(&mut conns, &mut opdirs, &mut unexpected, &tunables);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].op_id, id);
        assert_eq!(completions[0].user_ptr, 99);
        assert!(matches!(completions[0].status, ErrorKind::Ok));
    }

    #[test]
    fn failed_completion_cancels_the_connection() {
        let mut conns = ConnectionTable::new();
        let mut opdirs = hashbrown::HashMap::new();
        let tunables = Tunables::default();

        let mut conn = fresh_connection();
        let mut opdir = OpDirectory::new();
        let id = opdir.insert(|mop_id| {
            WorkItem::Send(SendItem {
                state: SendState::WaitingEagerSendCompletion,
                buflist: Buflist::new(vec![(0, 4)]),
                tag: 1,
                mop_id,
                is_unexpected: false,
                bh: None,
                user_ptr: 0,
            })
        });
        let mut cq = FakeCompletionQueue::default();
        cq.push(id.0, WcOpcode::Send, 0, false);
        conn.cq = Box::new(cq);

        let h = conns.insert(conn);
        opdirs.insert(h, opdir);
        let mut unexpected = UnexpectedQueue::new();

        Poller::tick(&mut conns, &mut opdirs, &mut unexpected, &tunables);
        assert!(conns.get(h).unwrap().cancelled);
    }
}
