//! Per-peer transport state: credits, outstanding-work counters, handshake
//! progress, RNR backoff and the ordering buffer for early request arrivals.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::flow_control::RnrBackoff;
use crate::pools::packet_pool::PacketHandle;
use crate::transport::PeerAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Nothing received from or sent to this peer yet.
    NotSent,
    /// We owe the peer a handshake but could not post it; retried each tick.
    Queued,
    Sent,
    /// The peer's handshake arrived; `features` is valid.
    Received,
}

pub struct Peer {
    pub addr: PeerAddr,
    pub is_local: bool,

    /// Credits still available for new transfers towards this peer.
    pub tx_credits: u32,
    initial_credits: u32,

    /// Transfers admitted and not yet completed, towards this peer. Feeds
    /// the fair-share divisor of the credit computation.
    pub outstanding_ops: u32,

    /// Device-level posts in flight towards this peer.
    pub outstanding_tx_packets: u32,

    pub backoff: RnrBackoff,
    pub handshake: HandshakeStatus,
    /// Feature bits from the peer's handshake.
    pub features: u32,

    next_msg_id: u64,
    /// Next inbound message id accepted in ordered mode.
    pub expected_msg_id: u64,
    /// Early request arrivals, staged in out-of-order pool packets until
    /// their predecessors show up. Keyed by message id.
    pub reordered: BTreeMap<u64, PacketHandle>,
}

impl Peer {
    pub fn new(
        addr: PeerAddr,
        is_local: bool,
        credits: u32,
        backoff_initial: Duration,
        backoff_cap: Duration,
    ) -> Peer {
        Peer {
            addr,
            is_local,
            tx_credits: credits,
            initial_credits: credits,
            outstanding_ops: 0,
            outstanding_tx_packets: 0,
            backoff: RnrBackoff::new(backoff_initial, backoff_cap),
            handshake: HandshakeStatus::NotSent,
            features: 0,
            next_msg_id: 0,
            expected_msg_id: 0,
            reordered: BTreeMap::new(),
        }
    }

    /// Atomically takes `n` credits, or leaves the balance untouched.
    pub fn try_consume_credits(&mut self, n: u32) -> bool {
        if self.tx_credits >= n {
            self.tx_credits -= n;
            true
        } else {
            false
        }
    }

    pub fn return_credits(&mut self, n: u32) {
        self.tx_credits += n;
        assert!(
            self.tx_credits <= self.initial_credits,
            "credit conservation violated for peer {}: {} > {}",
            self.addr, self.tx_credits, self.initial_credits
        );
    }

    pub fn alloc_msg_id(&mut self) -> u64 {
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(7, false, 8, Duration::from_micros(100), Duration::from_millis(1))
    }

    #[test]
    fn test_credit_consume_and_return() {
        let mut p = peer();
        assert!(p.try_consume_credits(5));
        assert_eq!(p.tx_credits, 3);

        assert!(!p.try_consume_credits(4), "insufficient credits must not change the balance");
        assert_eq!(p.tx_credits, 3);

        p.return_credits(5);
        assert_eq!(p.tx_credits, 8);
    }

    #[test]
    #[should_panic(expected = "credit conservation")]
    fn test_over_return_panics() {
        let mut p = peer();
        p.return_credits(1);
    }

    #[test]
    fn test_msg_ids_are_sequential() {
        let mut p = peer();
        assert_eq!(p.alloc_msg_id(), 0);
        assert_eq!(p.alloc_msg_id(), 1);
        assert_eq!(p.alloc_msg_id(), 2);
    }
}
