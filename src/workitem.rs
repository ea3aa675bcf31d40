//! Work items: one per posted send or recv (spec §3), plus the op-id
//! generator and directory (spec §4.5 "Op id generation").

use bytes::Bytes;
use hashbrown::HashMap;

use crate::bufpool::BufHead;
use crate::memcache::RegionKeys;

/// The opaque 64-bit caller handle for one posted operation ("mop id").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

/// Monotonic generator for [`OpId`]s.
#[derive(Default)]
pub struct OpIdGenerator {
    next: u64,
}

impl OpIdGenerator {
    pub fn next(&mut self) -> OpId {
        let id = OpId(self.next);
        self.next += 1;
        id
    }
}

/// One `(address, length)` scatter/gather segment, optionally registered.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub addr: usize,
    pub len: usize,
    pub keys: Option<RegionKeys>,
}

/// An ordered scatter/gather list plus its declared total length.
#[derive(Debug, Clone, Default)]
pub struct Buflist {
    pub segments: Vec<Segment>,
    pub total_len: usize,
}

impl Buflist {
    pub fn new(segments: Vec<(usize, usize)>) -> Self {
        let total_len = segments.iter().map(|(_, l)| l).sum();
        Buflist {
            segments: segments
                .into_iter()
                .map(|(addr, len)| Segment {
                    addr,
                    len,
                    keys: None,
                })
                .collect(),
            total_len,
        }
    }

    /// Validate a caller-supplied `total_size` against the sum of segment
    /// lengths (spec §4.5 edge case (i)).
    pub fn declared_len_matches(&self, claimed_total: usize) -> bool {
        self.total_len == claimed_total
    }

    pub fn is_registered(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| s.keys.is_some())
    }
}

/// Send-side state machine (spec §3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    WaitingBuffer,
    WaitingEagerSendCompletion,
    WaitingRtsSendCompletion,
    WaitingCts,
    WaitingRtsSendCompletionGotCts,
    WaitingDataSendCompletion,
    WaitingRtsDoneBuffer,
    WaitingRtsDoneSendCompletion,
    WaitingUserTest,
    Cancelled,
    Error,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SendState::WaitingUserTest | SendState::Cancelled | SendState::Error
        )
    }
}

bitflags::bitflags! {
    /// Recv-side state bitset (spec §3): several states can be concurrent,
    /// e.g. a rendezvous recv is simultaneously `RtsWaitingCtsBuffer` and
    /// (once matched) no longer `WaitingIncoming`.
    pub struct RecvState: u32 {
        const WAITING_INCOMING               = 1 << 0;
        const EAGER_WAITING_USER_POST         = 1 << 1;
        const EAGER_WAITING_USER_TEST         = 1 << 2;
        const EAGER_WAITING_USER_TEST_UNEXPECTED = 1 << 3;
        const RTS_WAITING_USER_POST           = 1 << 4;
        const RTS_WAITING_CTS_BUFFER          = 1 << 5;
        const RTS_WAITING_CTS_SEND_COMPLETION = 1 << 6;
        const RTS_WAITING_RTS_DONE            = 1 << 7;
        const RTS_WAITING_USER_TEST           = 1 << 8;
        const CANCELLED                       = 1 << 9;
        const ERROR                           = 1 << 10;
    }
}

impl RecvState {
    pub fn is_terminal(self) -> bool {
        self.intersects(
            RecvState::RTS_WAITING_USER_TEST
                | RecvState::EAGER_WAITING_USER_TEST
                | RecvState::EAGER_WAITING_USER_TEST_UNEXPECTED
                | RecvState::CANCELLED
                | RecvState::ERROR,
        )
    }
}

#[derive(Debug, Clone)]
pub struct SendItem {
    pub state: SendState,
    pub buflist: Buflist,
    pub tag: u32,
    pub mop_id: OpId,
    pub is_unexpected: bool,
    pub bh: Option<BufHead>,
    /// Caller-supplied opaque pointer, returned unchanged on completion.
    pub user_ptr: u64,
}

#[derive(Debug, Clone)]
pub struct RecvItem {
    pub state: RecvState,
    pub buflist: Buflist,
    pub tag: u32,
    pub mop_id: OpId,
    /// The sender's mop id, learned from the RTS header; used to match
    /// the eventual RTS_DONE to this recv.
    pub rts_mop_id: Option<OpId>,
    pub bh: Option<BufHead>,
    /// Bytes actually delivered — may be less than `buflist.total_len` on
    /// truncation (spec §4.5 edge case (iii)).
    pub actual_len: usize,
    pub user_ptr: u64,
    /// A regular eager send that arrived before its matching `post_recv`
    /// (`EAGER_WAITING_USER_POST`): held here until the post arrives and
    /// claims it.
    pub eager_payload: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum WorkItem {
    Send(SendItem),
    Recv(RecvItem),
}

impl WorkItem {
    pub fn mop_id(&self) -> OpId {
        match self {
            WorkItem::Send(s) => s.mop_id,
            WorkItem::Recv(r) => r.mop_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            WorkItem::Send(s) => s.state.is_terminal(),
            WorkItem::Recv(r) => r.state.is_terminal(),
        }
    }
}

/// Indexed directory mapping op id -> work item, for O(1) cancel/test
/// (spec §4.5). Ids are released on completion or cancel.
#[derive(Default)]
pub struct OpDirectory {
    gen: OpIdGenerator,
    items: HashMap<OpId, WorkItem>,
}

impl OpDirectory {
    pub fn new() -> Self {
        OpDirectory::default()
    }

    pub fn insert(&mut self, make: impl FnOnce(OpId) -> WorkItem) -> OpId {
        let id = self.gen.next();
        self.items.insert(id, make(id));
        id
    }

    pub fn get(&self, id: OpId) -> Option<&WorkItem> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut WorkItem> {
        self.items.get_mut(&id)
    }

    pub fn remove(&mut self, id: OpId) -> Option<WorkItem> {
        self.items.remove(&id)
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&OpId, &mut WorkItem)> {
        self.items.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_ids_are_monotonic() {
        let mut g = OpIdGenerator::default();
        let a = g.next();
        let b = g.next();
        assert!(b.0 > a.0);
    }

    #[test]
    fn directory_removal_releases_the_id_slot() {
        let mut dir = OpDirectory::new();
        let id = dir.insert(|id| {
            WorkItem::Send(SendItem {
                state: SendState::WaitingBuffer,
                buflist: Buflist::new(vec![(0, 64)]),
                tag: 1,
                mop_id: id,
                is_unexpected: false,
                bh: None,
                user_ptr: 0,
            })
        });
        assert!(dir.contains(id));
        dir.remove(id);
        assert!(!dir.contains(id));
    }

    #[test]
    fn buflist_validates_declared_total() {
        let bl = Buflist::new(vec![(0, 10), (100, 20)]);
        assert_eq!(bl.total_len, 30);
        assert!(bl.declared_len_matches(30));
        assert!(!bl.declared_len_matches(31));
    }

    #[test]
    fn recv_state_bitset_allows_concurrent_flags() {
        let s = RecvState::RTS_WAITING_CTS_BUFFER | RecvState::RTS_WAITING_CTS_SEND_COMPLETION;
        assert!(s.contains(RecvState::RTS_WAITING_CTS_BUFFER));
        assert!(s.contains(RecvState::RTS_WAITING_CTS_SEND_COMPLETION));
        assert!(!s.is_terminal());
        assert!(RecvState::RTS_WAITING_USER_TEST.is_terminal());
    }

    #[test]
    fn send_terminal_states() {
        assert!(SendState::WaitingUserTest.is_terminal());
        assert!(SendState::Cancelled.is_terminal());
        assert!(!SendState::WaitingCts.is_terminal());
    }
}
