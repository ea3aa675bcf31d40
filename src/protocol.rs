//! The wire protocol engine (spec §4.1): eager/rendezvous path selection,
//! RTS/CTS/RTS_DONE generation and matching, and credit accounting glue.
//! Pure state-transition logic — the poller is the only caller, and it is
//! the only place in the crate allowed to touch [`Connection`] state.

use bytes::{Bytes, BytesMut};

use crate::addr::AddrId;
use crate::bufpool::BufHead;
use crate::config::Tunables;
use crate::connection::Connection;
use crate::error::{BmiError, Result};
use crate::unexpected::{UnexpectedMessage, UnexpectedQueue};
use crate::wire::{self, CommonHeader, Cts, CtsSegment, EagerSend, HeaderOnly, MessageType, Rts, RtsDone};
use crate::workitem::{Buflist, OpDirectory, OpId, RecvItem, RecvState, SendItem, SendState, WorkItem};

/// Which path a send of `total_len` takes (spec §4.1, §3 invariant e).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Eager,
    Rendezvous,
}

pub fn classify(total_len: usize, tunables: &Tunables) -> PathKind {
    if total_len <= tunables.eager_payload_max() {
        PathKind::Eager
    } else {
        PathKind::Rendezvous
    }
}

/// Validate and enqueue a send, returning the op id the caller tests
/// against later. Does not itself post to the wire — [`drive_send`]
/// does that once a send-BufHead is available, so a `WaitingBuffer` stall
/// is just "not driven yet", not a separate code path.
pub fn submit_send(
    opdir: &mut OpDirectory,
    tunables: &Tunables,
    buflist: Buflist,
    total_len: usize,
    tag: u32,
    unexpected: bool,
    user_ptr: u64,
) -> Result<OpId> {
    if !buflist.declared_len_matches(total_len) {
        return Err(BmiError::InvalidArgument(format!(
            "declared total_len {total_len} does not match sum of segment lengths {}",
            buflist.total_len
        )));
    }
    if unexpected && total_len > tunables.eager_payload_max() {
        return Err(BmiError::Oversize(format!(
            "unexpected send of {total_len} bytes exceeds eager payload max {}",
            tunables.eager_payload_max()
        )));
    }

    Ok(opdir.insert(|mop_id| {
        WorkItem::Send(SendItem {
            state: SendState::WaitingBuffer,
            buflist,
            tag,
            mop_id,
            is_unexpected: unexpected,
            bh: None,
            user_ptr,
        })
    }))
}

/// Enqueue a recv. `expected_len` bounds what the caller is willing to
/// receive; an arrival larger than this is truncated (spec §4.5 edge case
/// iii), not rejected.
///
/// A regular eager send may have already arrived for this tag and be
/// sitting in `EAGER_WAITING_USER_POST` (spec §8 scenario 3); in that case
/// this claims it and delivers immediately instead of waiting on the wire.
pub fn submit_recv(
    opdir: &mut OpDirectory,
    buflist: Buflist,
    tag: u32,
    user_ptr: u64,
) -> OpId {
    if let Some(id) = find_pending_eager_post(opdir, tag) {
        let WorkItem::Recv(r) = opdir.get_mut(id).unwrap() else {
            unreachable!()
        };
        r.buflist = buflist;
        r.user_ptr = user_ptr;
        if let Some(payload) = r.eager_payload.take() {
            deliver_eager_payload(r, &payload);
        }
        r.state = RecvState::EAGER_WAITING_USER_TEST;
        return id;
    }

    opdir.insert(|mop_id| {
        WorkItem::Recv(RecvItem {
            state: RecvState::WAITING_INCOMING,
            buflist,
            tag,
            mop_id,
            rts_mop_id: None,
            bh: None,
            actual_len: 0,
            user_ptr,
            eager_payload: None,
        })
    })
}

/// Oldest-first match of an already-arrived regular eager send waiting on
/// its `post_recv` (spec §8 scenario 3).
fn find_pending_eager_post(opdir: &mut OpDirectory, tag: u32) -> Option<OpId> {
    opdir
        .iter_mut()
        .filter_map(|(id, item)| match item {
            WorkItem::Recv(r) if r.tag == tag && r.state.contains(RecvState::EAGER_WAITING_USER_POST) => {
                Some(*id)
            }
            _ => None,
        })
        .min()
}

/// Drive every `WaitingBuffer` send whose BufHead wasn't available at
/// submit time, in FIFO order (spec §4.1 "Fairness & ordering"), as far as
/// the pool and credit allow.
pub fn drain_waiting_sends(
    conn: &mut Connection,
    opdir: &mut OpDirectory,
    tunables: &Tunables,
) -> Result<()> {
    loop {
        let next = opdir
            .iter_mut()
            .filter_map(|(id, item)| match item {
                WorkItem::Send(s) if s.state == SendState::WaitingBuffer => Some(*id),
                _ => None,
            })
            .min();
        let Some(id) = next else { break };
        if !conn.try_take_send_credit() {
            break;
        }
        let Some(bh) = conn.send_pool.try_acquire() else {
            conn.add_send_credit(1);
            break;
        };
        drive_send(conn, opdir, tunables, id, bh)?;
    }
    Ok(())
}

fn drive_send(
    conn: &mut Connection,
    opdir: &mut OpDirectory,
    tunables: &Tunables,
    id: OpId,
    bh: BufHead,
) -> Result<()> {
    let WorkItem::Send(item) = opdir.get_mut(id).expect("op id just selected from directory") else {
        unreachable!("send id came from a Send-filtered scan");
    };

    let path = classify(item.buflist.total_len, tunables);
    let credit_return = conn.take_return_credit();
    let mut buf = BytesMut::with_capacity(conn.send_pool.buf_size());

    match path {
        PathKind::Eager => {
            let msg_type = if item.is_unexpected {
                MessageType::EagerSendUnexpected
            } else {
                MessageType::EagerSend
            };
            // A real buflist may be scattered; the eager path always fits
            // in one BufHead, so flatten it into the send buffer here.
            let mut payload = Vec::with_capacity(item.buflist.total_len);
            for seg in &item.buflist.segments {
                let src = unsafe {
                    std::slice::from_raw_parts(seg.addr as *const u8, seg.len)
                };
                payload.extend_from_slice(src);
            }
            EagerSend {
                common: CommonHeader {
                    msg_type,
                    credit_return,
                },
                bmi_tag: item.tag,
                payload: Bytes::from(payload),
            }
            .encode(&mut buf);
            item.state = SendState::WaitingEagerSendCompletion;
        }
        PathKind::Rendezvous => {
            Rts {
                common: CommonHeader {
                    msg_type: MessageType::Rts,
                    credit_return,
                },
                bmi_tag: item.tag,
                mop_id: item.mop_id.0,
                total_len: item.buflist.total_len as u64,
            }
            .encode(&mut buf);
            item.state = SendState::WaitingRtsSendCompletion;
        }
    }

    conn.send_pool.slice_mut(&bh)[..buf.len()].copy_from_slice(&buf);
    let lkey = conn.send_region.map(|r| r.lkey).unwrap_or(0);
    let signaled = conn.should_signal_send();
    conn.qp.post_send(id.0, bh.addr, buf.len(), lkey, signaled)?;

    let WorkItem::Send(item) = opdir.get_mut(id).unwrap() else {
        unreachable!()
    };
    item.bh = Some(bh);
    Ok(())
}

/// A `RECV, ok` completion (spec §4.2 step 2): parse the common header,
/// apply the piggybacked credit, and demux into the right handler.
pub fn on_message_received(
    conn: &mut Connection,
    opdir: &mut OpDirectory,
    unexpected: &mut UnexpectedQueue,
    payload: Bytes,
) -> Result<()> {
    let mut probe = payload.clone();
    let header = CommonHeader::decode(&mut probe)?;
    if header.credit_return > 0 {
        conn.add_send_credit(header.credit_return);
    }

    match header.msg_type {
        MessageType::EagerSend | MessageType::EagerSendUnexpected => {
            handle_eager_send(conn, opdir, unexpected, EagerSend::decode(payload)?)
        }
        MessageType::Rts => handle_rts(opdir, Rts::decode(payload)?),
        MessageType::Cts => handle_cts(conn, opdir, Cts::decode(payload)?),
        MessageType::RtsDone => handle_rts_done(conn, opdir, RtsDone::decode(payload)?),
        MessageType::Credit => Ok(()),
        MessageType::Bye => {
            conn.closed = true;
            Ok(())
        }
    }
}

/// Oldest-first match of a waiting recv by tag (spec §4.1 "Tie-breaks"): a
/// recv only wins the match if it is still `WAITING_INCOMING`.
fn find_matching_recv(opdir: &mut OpDirectory, tag: u32) -> Option<OpId> {
    opdir
        .iter_mut()
        .filter_map(|(id, item)| match item {
            WorkItem::Recv(r) if r.tag == tag && r.state.contains(RecvState::WAITING_INCOMING) => {
                Some(*id)
            }
            _ => None,
        })
        .min()
}

fn handle_eager_send(
    conn: &mut Connection,
    opdir: &mut OpDirectory,
    unexpected: &mut UnexpectedQueue,
    msg: EagerSend,
) -> Result<()> {
    let owed = conn.note_recv_consumed(conn.recv_pool.capacity());
    let _ = owed; // explicit CREDIT emission is the poller's job once this returns.

    match find_matching_recv(opdir, msg.bmi_tag) {
        Some(id) => {
            let WorkItem::Recv(r) = opdir.get_mut(id).unwrap() else {
                unreachable!()
            };
            deliver_eager_payload(r, &msg.payload);
            r.state = RecvState::EAGER_WAITING_USER_TEST;
        }
        None if msg.common.msg_type == MessageType::EagerSendUnexpected => {
            // Arrived before posted and the sender never expected a
            // matching post: hand to the unexpected-message queue (spec
            // §3/§4.5), drainable only via `testunexpected`.
            unexpected.push(UnexpectedMessage {
                peer: conn.peer,
                tag: msg.bmi_tag,
                payload: msg.payload,
            });
        }
        None => {
            // A regular eager send arrived before its matching post (spec
            // §8 scenario 3): hold it as a recv record so the eventual
            // `post_recv` for this tag claims and completes it.
            opdir.insert(|mop_id| {
                WorkItem::Recv(RecvItem {
                    state: RecvState::EAGER_WAITING_USER_POST,
                    buflist: Buflist::default(),
                    tag: msg.bmi_tag,
                    mop_id,
                    rts_mop_id: None,
                    bh: None,
                    actual_len: 0,
                    user_ptr: 0,
                    eager_payload: Some(msg.payload),
                })
            });
        }
    }
    Ok(())
}

/// Copy an arrived eager payload into a recv's buflist segments,
/// truncating to `buflist.total_len` (spec §4.5 edge case (iii)).
fn deliver_eager_payload(r: &mut RecvItem, payload: &Bytes) {
    let n = payload.len().min(r.buflist.total_len);
    for (seg, chunk) in r.buflist.segments.iter().zip(split_into(payload, &r.buflist)) {
        let dst = unsafe { std::slice::from_raw_parts_mut(seg.addr as *mut u8, seg.len) };
        dst[..chunk.len()].copy_from_slice(chunk);
    }
    r.actual_len = n;
}

/// Split `payload` across `buflist`'s segment boundaries for a scattered
/// recv; a single-segment buflist just gets the whole slice back once.
fn split_into<'a>(payload: &'a Bytes, buflist: &Buflist) -> Vec<&'a [u8]> {
    let mut out = Vec::with_capacity(buflist.segments.len());
    let mut off = 0usize;
    for seg in &buflist.segments {
        let end = (off + seg.len).min(payload.len());
        out.push(&payload[off.min(payload.len())..end]);
        off = end;
    }
    out
}

fn handle_rts(opdir: &mut OpDirectory, msg: Rts) -> Result<()> {
    match find_matching_recv(opdir, msg.bmi_tag) {
        Some(id) => {
            let WorkItem::Recv(r) = opdir.get_mut(id).unwrap() else {
                unreachable!()
            };
            r.rts_mop_id = Some(OpId(msg.mop_id));
            r.state = RecvState::RTS_WAITING_CTS_BUFFER;
        }
        None => {
            opdir.insert(|mop_id| {
                WorkItem::Recv(RecvItem {
                    state: RecvState::RTS_WAITING_USER_POST,
                    buflist: Buflist {
                        segments: vec![],
                        total_len: msg.total_len as usize,
                    },
                    tag: msg.bmi_tag,
                    mop_id,
                    rts_mop_id: Some(OpId(msg.mop_id)),
                    bh: None,
                    actual_len: 0,
                    user_ptr: 0,
                    eager_payload: None,
                })
            });
        }
    }
    Ok(())
}

/// Once a recv is `RTS_WAITING_CTS_BUFFER` and a send-BufHead is free,
/// register its buflist and emit the CTS (spec §4.1 "Clear-To-Send").
pub fn drive_cts(conn: &mut Connection, opdir: &mut OpDirectory) -> Result<()> {
    let next = opdir
        .iter_mut()
        .filter_map(|(id, item)| match item {
            WorkItem::Recv(r) if r.state.contains(RecvState::RTS_WAITING_CTS_BUFFER) => Some(*id),
            _ => None,
        })
        .min();
    let Some(id) = next else { return Ok(()) };
    let Some(bh) = conn.send_pool.try_acquire() else {
        return Ok(());
    };

    let segments: Vec<CtsSegment> = {
        let WorkItem::Recv(r) = opdir.get_mut(id).unwrap() else {
            unreachable!()
        };
        let mut segs = Vec::with_capacity(r.buflist.segments.len().max(1));
        for seg in &r.buflist.segments {
            let keys = conn.mem_cache.register(&mut *conn.registrar, seg.addr, seg.len)?;
            segs.push(CtsSegment {
                addr: seg.addr as u64,
                len: seg.len as u32,
                rkey: keys.rkey,
            });
        }
        segs
    };

    let rts_mop_id = {
        let WorkItem::Recv(r) = opdir.get(id).unwrap() else {
            unreachable!()
        };
        r.rts_mop_id.expect("CTS driven only from RTS-matched recv")
    };

    let credit_return = conn.take_return_credit();
    let mut buf = BytesMut::with_capacity(conn.send_pool.buf_size());
    Cts {
        common: CommonHeader {
            msg_type: MessageType::Cts,
            credit_return,
        },
        rts_mop_id: rts_mop_id.0,
        total_len: {
            let WorkItem::Recv(r) = opdir.get(id).unwrap() else {
                unreachable!()
            };
            r.buflist.total_len as u64
        },
        segments,
    }
    .encode(&mut buf);

    conn.send_pool.slice_mut(&bh)[..buf.len()].copy_from_slice(&buf);
    let lkey = conn.send_region.map(|r| r.lkey).unwrap_or(0);
    let signaled = conn.should_signal_send();
    conn.qp.post_send(id.0, bh.addr, buf.len(), lkey, signaled)?;

    let WorkItem::Recv(r) = opdir.get_mut(id).unwrap() else {
        unreachable!()
    };
    r.bh = Some(bh);
    r.state = RecvState::RTS_WAITING_RTS_DONE;
    Ok(())
}

/// Once a send is `WaitingRtsDoneBuffer` (the RDMA_WRITE landed) and a
/// send-BufHead is free, post the RTS_DONE ack and move it to
/// `WaitingRtsDoneSendCompletion` (spec §4.1 "Rendezvous — Done").
pub fn drive_rts_done(conn: &mut Connection, opdir: &mut OpDirectory) -> Result<()> {
    let next = opdir
        .iter_mut()
        .filter_map(|(id, item)| match item {
            WorkItem::Send(s) if s.state == SendState::WaitingRtsDoneBuffer => Some(*id),
            _ => None,
        })
        .min();
    let Some(id) = next else { return Ok(()) };
    let Some(bh) = conn.send_pool.try_acquire() else {
        return Ok(());
    };

    let mop_id = {
        let WorkItem::Send(item) = opdir.get(id).unwrap() else {
            unreachable!()
        };
        item.mop_id.0
    };

    let credit_return = conn.take_return_credit();
    let mut buf = BytesMut::with_capacity(conn.send_pool.buf_size());
    RtsDone {
        common: CommonHeader {
            msg_type: MessageType::RtsDone,
            credit_return,
        },
        mop_id,
    }
    .encode(&mut buf);

    conn.send_pool.slice_mut(&bh)[..buf.len()].copy_from_slice(&buf);
    let lkey = conn.send_region.map(|r| r.lkey).unwrap_or(0);
    let signaled = conn.should_signal_send();
    conn.qp.post_send(id.0, bh.addr, buf.len(), lkey, signaled)?;

    let WorkItem::Send(item) = opdir.get_mut(id).unwrap() else {
        unreachable!()
    };
    item.bh = Some(bh);
    item.state = SendState::WaitingRtsDoneSendCompletion;
    Ok(())
}

fn handle_cts(conn: &mut Connection, opdir: &mut OpDirectory, msg: Cts) -> Result<()> {
    let id = OpId(msg.rts_mop_id);
    let WorkItem::Send(item) = opdir
        .get_mut(id)
        .ok_or_else(|| BmiError::Protocol(format!("CTS for unknown mop_id {}", msg.rts_mop_id)))?
    else {
        return Err(BmiError::Protocol("CTS matched a non-send op".into()));
    };
    if item.buflist.total_len != msg.total_len as usize {
        return Err(BmiError::Protocol(
            "CTS total_len disagrees with the original RTS".into(),
        ));
    }

    let mut local_off = 0usize;
    for (i, remote) in msg.segments.iter().enumerate() {
        let local = item
            .buflist
            .segments
            .get(i)
            .ok_or_else(|| BmiError::Protocol("CTS has more segments than the RTS buflist".into()))?;
        let lkey = local.keys.map(|k| k.lkey).unwrap_or(0);
        let signaled = i + 1 == msg.segments.len();
        conn.qp.post_rdma_write(
            item.mop_id.0,
            local.addr,
            local.len,
            lkey,
            remote.addr,
            remote.rkey,
            signaled && conn.should_signal_send(),
        )?;
        local_off += local.len;
    }
    let _ = local_off;

    item.state = SendState::WaitingRtsSendCompletionGotCts;
    Ok(())
}

/// Oldest-first match of the recv a RTS_DONE acks, by the sender's own
/// mop id (stashed as `rts_mop_id` when the RTS arrived) — the sender has
/// no way to know the receiver's local directory key.
fn find_recv_by_rts_mop_id(opdir: &mut OpDirectory, sender_mop_id: OpId) -> Option<OpId> {
    opdir
        .iter_mut()
        .filter_map(|(id, item)| match item {
            WorkItem::Recv(r) if r.rts_mop_id == Some(sender_mop_id) => Some(*id),
            _ => None,
        })
        .min()
}

fn handle_rts_done(conn: &mut Connection, opdir: &mut OpDirectory, msg: RtsDone) -> Result<()> {
    let id = find_recv_by_rts_mop_id(opdir, OpId(msg.mop_id))
        .ok_or_else(|| BmiError::Protocol(format!("RTS_DONE for unknown mop_id {}", msg.mop_id)))?;
    let WorkItem::Recv(r) = opdir.get_mut(id).unwrap() else {
        return Err(BmiError::Protocol("RTS_DONE matched a non-recv op".into()));
    };
    r.state.remove(RecvState::RTS_WAITING_RTS_DONE);
    r.state.insert(RecvState::RTS_WAITING_USER_TEST);
    r.actual_len = r.buflist.total_len;
    for seg in &r.buflist.segments {
        conn.mem_cache.deregister(seg.addr, seg.len);
    }
    Ok(())
}

/// An explicit `CREDIT`-or-`BYE` control message with no payload,
/// encoded standalone for the poller to post when it isn't piggybacking
/// on a data message.
pub fn encode_control(msg_type: MessageType, credit_return: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(wire::COMMON_HEADER_SIZE);
    HeaderOnly {
        common: CommonHeader {
            msg_type,
            credit_return,
        },
    }
    .encode(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{FakeCompletionQueue, FakeQueuePair, FakeRegistrar};

    fn fresh_connection(eager_buf_num: usize, eager_buf_size: usize) -> Connection {
        Connection::new(
            crate::addr::AddrId(0),
            "peer".into(),
            eager_buf_num,
            eager_buf_size,
            Box::new(FakeQueuePair::default()),
            Box::new(FakeCompletionQueue::default()),
            Box::new(FakeRegistrar::default()),
            0,
        )
    }

    #[test]
    fn classifies_by_eager_threshold() {
        let t = Tunables::default();
        assert_eq!(classify(64, &t), PathKind::Eager);
        assert_eq!(classify(t.eager_payload_max() + 1, &t), PathKind::Rendezvous);
    }

    #[test]
    fn submit_send_rejects_declared_length_mismatch() {
        let mut opdir = OpDirectory::new();
        let t = Tunables::default();
        let bl = Buflist::new(vec![(0, 10), (100, 20)]);
        assert!(submit_send(&mut opdir, &t, bl, 31, 1, false, 0).is_err());
    }

    #[test]
    fn submit_send_rejects_oversize_unexpected() {
        let mut opdir = OpDirectory::new();
        let t = Tunables::default();
        let big = t.eager_payload_max() + 1;
        let bl = Buflist::new(vec![(0, big)]);
        assert!(submit_send(&mut opdir, &t, bl, big, 1, true, 0).is_err());
    }

    #[test]
    fn eager_send_is_driven_once_buffer_and_credit_are_available() {
        let mut conn = fresh_connection(4, 256);
        let mut opdir = OpDirectory::new();
        let t = Tunables::default();
        let mut src = vec![1u8, 2, 3, 4];
        let bl = Buflist::new(vec![(src.as_mut_ptr() as usize, src.len())]);
        let id = submit_send(&mut opdir, &t, bl, src.len(), 7, false, 42).unwrap();

        drain_waiting_sends(&mut conn, &mut opdir, &t).unwrap();

        let WorkItem::Send(item) = opdir.get(id).unwrap() else {
            panic!("expected send item")
        };
        assert_eq!(item.state, SendState::WaitingEagerSendCompletion);
        assert_eq!(conn.send_credit, 3 - 1);
    }

    #[test]
    fn rendezvous_send_posts_rts_and_waits_for_cts() {
        let mut conn = fresh_connection(4, 256);
        let mut opdir = OpDirectory::new();
        let t = Tunables::default();
        let big = t.eager_payload_max() + 1;
        let mut src = vec![0u8; big];
        let bl = Buflist::new(vec![(src.as_mut_ptr() as usize, src.len())]);
        let id = submit_send(&mut opdir, &t, bl, big, 7, false, 0).unwrap();

        drain_waiting_sends(&mut conn, &mut opdir, &t).unwrap();

        let WorkItem::Send(item) = opdir.get(id).unwrap() else {
            panic!("expected send item")
        };
        assert_eq!(item.state, SendState::WaitingRtsSendCompletion);
    }

    #[test]
    fn eager_recv_matches_oldest_waiting_same_tag_first() {
        let mut opdir = OpDirectory::new();
        let mut dst_a = vec![0u8; 4];
        let mut dst_b = vec![0u8; 4];
        let bl_a = Buflist::new(vec![(dst_a.as_mut_ptr() as usize, 4)]);
        let bl_b = Buflist::new(vec![(dst_b.as_mut_ptr() as usize, 4)]);
        let first = submit_recv(&mut opdir, bl_a, 5, 1);
        let _second = submit_recv(&mut opdir, bl_b, 5, 2);

        let mut conn = fresh_connection(4, 256);
        let mut buf = BytesMut::new();
        EagerSend {
            common: CommonHeader {
                msg_type: MessageType::EagerSend,
                credit_return: 0,
            },
            bmi_tag: 5,
            payload: Bytes::from_static(b"data"),
        }
        .encode(&mut buf);
        let mut unexpected = crate::unexpected::UnexpectedQueue::new();
        on_message_received(&mut conn, &mut opdir, &mut unexpected, buf.freeze()).unwrap();

        let WorkItem::Recv(r) = opdir.get(first).unwrap() else {
            panic!("expected recv item")
        };
        assert_eq!(r.state, RecvState::EAGER_WAITING_USER_TEST);
        assert_eq!(dst_a, b"data");
    }

    #[test]
    fn eager_arriving_before_post_is_queued_unexpected() {
        let mut conn = fresh_connection(4, 256);
        let mut opdir = OpDirectory::new();
        let mut buf = BytesMut::new();
        EagerSend {
            common: CommonHeader {
                msg_type: MessageType::EagerSendUnexpected,
                credit_return: 0,
            },
            bmi_tag: 9,
            payload: Bytes::from_static(b"surprise"),
        }
        .encode(&mut buf);
        let mut unexpected = crate::unexpected::UnexpectedQueue::new();
        on_message_received(&mut conn, &mut opdir, &mut unexpected, buf.freeze()).unwrap();

        assert!(opdir.is_empty());
        let drained = unexpected.drain_upto(1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].tag, 9);
        assert_eq!(&drained[0].payload[..], b"surprise");
    }

    #[test]
    fn regular_eager_arriving_before_post_is_held_then_matched_by_later_post_recv() {
        let mut conn = fresh_connection(4, 256);
        let mut opdir = OpDirectory::new();
        let mut buf = BytesMut::new();
        EagerSend {
            common: CommonHeader {
                msg_type: MessageType::EagerSend,
                credit_return: 0,
            },
            bmi_tag: 3,
            payload: Bytes::from_static(b"ping"),
        }
        .encode(&mut buf);
        let mut unexpected = crate::unexpected::UnexpectedQueue::new();
        on_message_received(&mut conn, &mut opdir, &mut unexpected, buf.freeze()).unwrap();

        assert!(unexpected.drain_upto(1).is_empty());
        assert_eq!(opdir.len(), 1);

        let mut dst = vec![0u8; 4];
        let bl = Buflist::new(vec![(dst.as_mut_ptr() as usize, 4)]);
        let id = submit_recv(&mut opdir, bl, 3, 7);

        let WorkItem::Recv(r) = opdir.get(id).unwrap() else {
            panic!("expected recv item")
        };
        assert_eq!(r.state, RecvState::EAGER_WAITING_USER_TEST);
        assert_eq!(r.actual_len, 4);
        assert_eq!(r.user_ptr, 7);
        assert_eq!(dst, b"ping");
    }

    #[test]
    fn drive_rts_done_posts_ack_and_advances_state() {
        let mut conn = fresh_connection(4, 256);
        let mut opdir = OpDirectory::new();
        let mut src = vec![0u8; 4];
        let bl = Buflist::new(vec![(src.as_mut_ptr() as usize, src.len())]);
        let id = opdir.insert(|mop_id| {
            WorkItem::Send(SendItem {
                state: SendState::WaitingRtsDoneBuffer,
                buflist: bl,
                tag: 1,
                mop_id,
                is_unexpected: false,
                bh: None,
                user_ptr: 0,
            })
        });

        drive_rts_done(&mut conn, &mut opdir).unwrap();

        let WorkItem::Send(item) = opdir.get(id).unwrap() else {
            panic!("expected send item")
        };
        assert_eq!(item.state, SendState::WaitingRtsDoneSendCompletion);
        assert!(item.bh.is_some());
    }

    #[test]
    fn rts_done_clears_recv_and_deregisters_buflist() {
        let mut conn = fresh_connection(4, 256);
        let mut opdir = OpDirectory::new();
        let mut dst = vec![0u8; 4];
        let bl = Buflist::new(vec![(dst.as_mut_ptr() as usize, 4)]);
        let recv_id = submit_recv(&mut opdir, bl, 1, 0);
        let sender_mop_id = OpId(recv_id.0 + 1000);
        {
            let WorkItem::Recv(r) = opdir.get_mut(recv_id).unwrap() else {
                panic!()
            };
            r.state = RecvState::RTS_WAITING_RTS_DONE;
            r.rts_mop_id = Some(sender_mop_id);
        }

        // The wire carries the *sender's* mop id, never the receiver's
        // own directory key — match on that, via `rts_mop_id`.
        let msg = RtsDone {
            common: CommonHeader {
                msg_type: MessageType::RtsDone,
                credit_return: 0,
            },
            mop_id: sender_mop_id.0,
        };
        handle_rts_done(&mut conn, &mut opdir, msg).unwrap();

        let WorkItem::Recv(r) = opdir.get(recv_id).unwrap() else {
            panic!()
        };
        assert!(r.state.contains(RecvState::RTS_WAITING_USER_TEST));
        assert_eq!(r.actual_len, 4);
    }

    #[test]
    fn encode_control_round_trips_through_header_decode() {
        let buf = encode_control(MessageType::Credit, 3);
        let decoded = CommonHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Credit);
        assert_eq!(decoded.credit_return, 3);
    }
}
