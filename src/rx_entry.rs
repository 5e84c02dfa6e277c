//! Inbound transfer state. An `RxEntry` is either a posted receive waiting
//! to match, the receiving half of a matched transfer, or the endpoint-side
//! record of an unexpected message waiting for a matching receive.

use std::collections::VecDeque;
use crate::pools::entry_pool::Handle;
use crate::pools::packet_pool::PacketHandle;
use crate::transport::PeerAddr;
use crate::wire::ReadRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Posted by the application, not yet matched.
    Init,
    /// Created for a request that no posted receive matched; its request
    /// datagram is staged in `staged_packet`.
    Unexpected,
    /// Matched with a request; no grant issued yet.
    Matched,
    /// Data inbound (sender-paced packets or local device reads).
    Receiving,
    /// A control packet (CTS, ACK, EOR) could not be posted and is retried
    /// by the drain step.
    QueuedCtrl,
    /// A posted control packet bounced with RNR.
    QueuedRnr,
}

/// The control packet an entry still owes its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCtrl {
    ClearToSend,
    Ack { bytes: u64 },
    EndOfRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSpec {
    /// `None` matches any sender.
    pub from: Option<PeerAddr>,
    /// `None` matches untagged messages only.
    pub tag: Option<u64>,
}

impl MatchSpec {
    pub fn matches(&self, src: PeerAddr, tag: Option<u64>) -> bool {
        if let Some(from) = self.from {
            if from != src {
                return false;
            }
        }
        self.tag == tag
    }
}

pub struct RxEntry {
    pub state: RxState,
    pub spec: MatchSpec,
    pub peer: Option<PeerAddr>,

    /// Landing buffer. Multi-recv children leave this empty and write into
    /// their parent's buffer instead.
    pub buffer: Vec<u8>,
    pub total_len: u64,
    pub bytes_received: u64,

    pub remote_tx_id: Option<u64>,
    pub msg_id: u64,

    /// Credits the sender asked for in its request; bounds the grant.
    pub credit_request: u32,
    /// Bytes granted to the sender so far.
    pub window_granted: u64,
    /// Receive-buffer budget units held by the open grant.
    pub credits_granted: u32,

    /// Unexpected staging: the request datagram, copied into the
    /// unexpected pool until a matching receive shows up.
    pub staged_packet: Option<PacketHandle>,
    /// Packets bounced with RNR, awaiting re-post.
    pub queued_packets: VecDeque<PacketHandle>,
    pub pending_ctrl: Option<PendingCtrl>,

    /// Set when the application cancelled after matching; the transfer is
    /// drained silently and no completion is delivered.
    pub cancelled: bool,

    pub multi_recv: bool,
    pub parent: Option<Handle<RxEntry>>,
    /// Open children carved from this multi-recv buffer.
    pub active_children: u32,
    /// Next free offset in a multi-recv buffer.
    pub consumed: usize,
    /// This child's offset into its parent's buffer.
    pub buffer_offset: usize,
    /// A consumed multi-recv parent that still has children keeps the
    /// buffer alive until the last child finishes.
    pub retired: bool,

    /// Set for remote writes: (region key, offset). The data lands in the
    /// exposed region and no receive completion is delivered.
    pub write_target: Option<(u64, u64)>,

    /// Sender regions for receiver-driven device reads.
    pub read_regions: Vec<ReadRegion>,
    pub read_fragments_total: u32,
    pub read_fragments_done: u32,

    pub user_context: u64,
}

impl RxEntry {
    pub fn posted(spec: MatchSpec, buffer: Vec<u8>, multi_recv: bool, user_context: u64) -> RxEntry {
        RxEntry {
            state: RxState::Init,
            spec,
            peer: None,
            buffer,
            total_len: 0,
            bytes_received: 0,
            remote_tx_id: None,
            msg_id: 0,
            credit_request: 0,
            window_granted: 0,
            credits_granted: 0,
            staged_packet: None,
            queued_packets: VecDeque::new(),
            pending_ctrl: None,
            cancelled: false,
            multi_recv,
            parent: None,
            active_children: 0,
            consumed: 0,
            buffer_offset: 0,
            retired: false,
            write_target: None,
            read_regions: Vec::new(),
            read_fragments_total: 0,
            read_fragments_done: 0,
            user_context,
        }
    }

    /// Entry for a request nothing matched; keeps only what is needed to
    /// process the staged request once a receive is posted.
    pub fn unexpected(src: PeerAddr, tag: Option<u64>, staged_packet: PacketHandle) -> RxEntry {
        let mut entry = RxEntry::posted(MatchSpec { from: Some(src), tag }, Vec::new(), false, 0);
        entry.state = RxState::Unexpected;
        entry.peer = Some(src);
        entry.staged_packet = Some(staged_packet);
        entry
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received >= self.total_len
    }

    /// Receives that have not matched yet are released immediately on
    /// cancel; later states drain silently.
    pub fn cancellable_immediately(&self) -> bool {
        matches!(self.state, RxState::Init | RxState::Unexpected | RxState::Matched)
    }
}
