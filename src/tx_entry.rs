//! Outbound transfer state. A `TxEntry` tracks one send, write, read or
//! atomic operation from submission to its user-visible completion.

use std::collections::VecDeque;
use bytes::{BufMut, Bytes};

use crate::error::Error;
use crate::pools::packet_pool::PacketHandle;
use crate::transport::{MrHandle, PeerAddr};
use crate::wire::AtomicOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Admitted; request not confirmed sent, or sent and awaiting CTS.
    Request,
    /// A control packet could not be posted; retried by the drain step.
    QueuedCtrl,
    /// At least one posted packet bounced with RNR and sits on
    /// `queued_packets` for re-posting.
    QueuedRnr,
    /// CTS received; data flows as the window allows.
    SendingData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    Send { tag: Option<u64> },
    Write { key: u64, offset: u64 },
    /// Device-level read from a remote exposed region into a local buffer.
    Read { key: u64, offset: u64 },
    Atomic { op: AtomicOp, key: u64, operand: u64, compare: u64, fetch: bool },
}

impl TxOp {
    pub fn expects_response(&self) -> bool {
        matches!(self, TxOp::Atomic { fetch: true, .. })
    }
}

pub struct TxEntry {
    pub peer: PeerAddr,
    pub op: TxOp,
    pub msg_id: u64,
    /// Gather list; never mutated after submission.
    pub segments: Vec<Bytes>,
    pub total_len: u64,
    pub state: TxState,

    /// Credits taken from the peer at admission; returned on release.
    pub credits_consumed: u32,
    pub credit_request: u32,

    /// Bytes the receiver currently allows beyond what it acknowledged.
    pub window: u64,
    pub bytes_sent: u64,
    pub bytes_acked: u64,

    pub remote_rx_id: Option<u64>,
    pub request_sent: bool,

    /// Packets bounced with RNR, awaiting re-post.
    pub queued_packets: VecDeque<PacketHandle>,

    /// Registrations exposing segments for receiver-driven device reads.
    pub exposed_mrs: Vec<MrHandle>,

    /// Fragment bookkeeping for `TxOp::Read`.
    pub read_fragments_total: u32,
    pub read_fragments_done: u32,
    /// Landing buffer for `TxOp::Read`, handed out with the completion.
    pub read_buffer: Vec<u8>,
    /// Fetched value of an atomic response.
    pub atomic_result: Option<u64>,

    pub user_context: u64,
    pub failure: Option<Error>,
}

impl TxEntry {
    pub fn new(peer: PeerAddr, op: TxOp, msg_id: u64, segments: Vec<Bytes>, user_context: u64) -> TxEntry {
        let total_len = segments.iter().map(|s| s.len() as u64).sum();
        TxEntry {
            peer,
            op,
            msg_id,
            segments,
            total_len,
            state: TxState::Request,
            credits_consumed: 0,
            credit_request: 0,
            window: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            remote_rx_id: None,
            request_sent: false,
            queued_packets: VecDeque::new(),
            exposed_mrs: Vec::new(),
            read_fragments_total: 0,
            read_fragments_done: 0,
            read_buffer: Vec::new(),
            atomic_result: None,
            user_context,
            failure: None,
        }
    }

    /// Gathers up to `max_len` payload bytes starting at `offset` into `out`.
    /// Returns the number of bytes written; short only at the end of the
    /// message.
    pub fn copy_payload(&self, offset: u64, max_len: usize, out: &mut impl BufMut) -> usize {
        let mut skip = offset;
        let mut written = 0usize;
        for segment in &self.segments {
            if skip >= segment.len() as u64 {
                skip -= segment.len() as u64;
                continue;
            }
            let start = skip as usize;
            skip = 0;
            let take = (segment.len() - start).min(max_len - written);
            out.put_slice(&segment[start..start + take]);
            written += take;
            if written == max_len {
                break;
            }
        }
        written
    }

    pub fn all_data_acked(&self) -> bool {
        self.bytes_acked >= self.total_len
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn entry_with_segments(segments: &[&'static [u8]]) -> TxEntry {
        let segments = segments.iter().map(|s| Bytes::from_static(s)).collect();
        TxEntry::new(1, TxOp::Send { tag: None }, 0, segments, 0)
    }

    #[test]
    fn test_total_len_sums_segments() {
        let entry = entry_with_segments(&[b"abc", b"", b"defgh"]);
        assert_eq!(entry.total_len, 8);
    }

    #[rstest]
    #[case::start(0, 4, b"abcd")]
    #[case::within_first(1, 2, b"bc")]
    #[case::across_boundary(2, 4, b"cdef")]
    #[case::second_segment(4, 3, b"efg")]
    #[case::to_end(5, 10, b"fgh")]
    #[case::at_end(8, 4, b"")]
    #[case::everything(0, 100, b"abcdefgh")]
    fn test_copy_payload(#[case] offset: u64, #[case] max_len: usize, #[case] expected: &[u8]) {
        let entry = entry_with_segments(&[b"abc", b"", b"defgh"]);
        let mut out = bytes::BytesMut::new();
        let written = entry.copy_payload(offset, max_len, &mut out);
        assert_eq!(written, expected.len());
        assert_eq!(&out[..], expected);
    }
}
